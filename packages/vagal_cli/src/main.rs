//! vagal: run and inspect HRV sensor sessions

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use vagal::hrv::{HrvMetrics, IntervalWindow, DEFAULT_SAMPLE_RATE_HZ, DEFAULT_WINDOW_CAPACITY};
use vagal::identity::{
    AuthProvider, CredentialStore, FileCredentialStore, HttpAuthProvider, MemoryCredentialStore,
    SessionCredential, SimAuthProvider,
};
use vagal::link::simulated::SimDeviceLink;
use vagal::link::DeviceDescriptor;
use vagal::session::{SessionConfig, SessionNotice, SessionOrchestrator};
use vagal::telemetry::LoopbackChannel;

const DEFAULT_CREDENTIAL_PATH: &str = "vagal_credential.json";

#[derive(Parser)]
#[command(name = "vagal", version, about = "Live heart-rate variability sessions")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full session against a simulated sensor and pairing service.
    Simulate {
        /// Resting heart rate the simulated sensor starts from.
        #[arg(long, default_value_t = 72)]
        bpm: i32,
        /// Stream beat intervals directly instead of deriving them from heart rate.
        #[arg(long)]
        intervals: bool,
        /// Unconfirmed polls before the simulated pairing is approved.
        #[arg(long, default_value_t = 1)]
        approve_after: usize,
        /// Stop after this many seconds. Runs until Ctrl+C when omitted.
        #[arg(long)]
        seconds: Option<u64>,
        /// JSON session configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: ConfigOverrides,
        /// Persist the credential here instead of in memory.
        #[arg(long)]
        credential: Option<PathBuf>,
    },
    /// Compute RMSSD and LF/HF power for a list of intervals in milliseconds.
    Metrics {
        #[arg(required = true)]
        intervals: Vec<f64>,
        #[arg(long, default_value_t = DEFAULT_WINDOW_CAPACITY)]
        capacity: usize,
        #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE_HZ)]
        sample_rate: f64,
    },
    /// Inspect or erase the saved credential.
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
        #[arg(long, global = true, default_value = DEFAULT_CREDENTIAL_PATH)]
        credential: PathBuf,
    },
    /// Pair with a remote auth service and save the credential.
    Pair {
        #[arg(long)]
        auth_url: String,
        #[arg(long, default_value = DEFAULT_CREDENTIAL_PATH)]
        credential: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

/// Individual session settings, applied on top of `--config`.
#[derive(Args, Debug, Default)]
struct ConfigOverrides {
    /// Intervals per analysis window.
    #[arg(long)]
    window_capacity: Option<usize>,
    /// Resampling rate for the spectral estimate, in Hz.
    #[arg(long)]
    sample_rate: Option<f64>,
    #[arg(long)]
    scan_timeout_secs: Option<u64>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    /// Period of the biometric_data snapshot.
    #[arg(long)]
    emit_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(capacity) = self.window_capacity {
            config.window_capacity = capacity;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate_hz = rate;
        }
        if let Some(secs) = self.scan_timeout_secs {
            config.scan_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.pairing_poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = self.emit_interval_ms {
            config.emit_interval = Duration::from_millis(ms);
        }
    }
}

#[derive(Subcommand)]
enum CredentialAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Simulate {
            bpm,
            intervals,
            approve_after,
            seconds,
            config,
            overrides,
            credential,
        } => {
            let mut config = load_config(config.as_deref())?;
            overrides.apply(&mut config);
            simulate(config, bpm, intervals, approve_after, seconds, credential).await?;
        }
        Commands::Metrics {
            intervals,
            capacity,
            sample_rate,
        } => {
            let mut window = IntervalWindow::new(capacity);
            let admitted = intervals.iter().filter(|&&v| window.admit(v)).count();
            let metrics = HrvMetrics::compute(&window, sample_rate);
            println!(
                "admitted {} of {} intervals, window holds {}",
                admitted,
                intervals.len(),
                window.len()
            );
            println!("rmssd: {:.2} ms", metrics.rmssd);
            println!("lf:    {:.2}", metrics.lf);
            println!("hf:    {:.2}", metrics.hf);
        }
        Commands::Credential { action, credential } => {
            let store = FileCredentialStore::open(&credential)
                .with_context(|| format!("opening {}", credential.display()))?;
            match action {
                CredentialAction::Show => match store.get()? {
                    Some(saved) => {
                        println!("{}", serde_json::to_string_pretty(&saved)?);
                        if saved.is_expired() {
                            println!("(expired)");
                        }
                    }
                    None => println!("No credential saved at {}", credential.display()),
                },
                CredentialAction::Clear => {
                    store.clear()?;
                    println!("Cleared {}", credential.display());
                }
            }
        }
        Commands::Pair {
            auth_url,
            credential,
            config,
            overrides,
        } => {
            let mut config = load_config(config.as_deref())?;
            overrides.apply(&mut config);
            pair(&auth_url, &credential, &config).await?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing session config {}", path.display()))?;
    Ok(config)
}

async fn simulate(
    config: SessionConfig,
    bpm: i32,
    intervals: bool,
    approve_after: usize,
    seconds: Option<u64>,
    credential: Option<PathBuf>,
) -> Result<()> {
    let link = Arc::new(SimDeviceLink::new());
    link.advertise(DeviceDescriptor::new("SIM-HRM-01", "Vagal Sim HRM", Some(-55)));
    link.set_interval_capable(intervals);

    let store: Arc<dyn CredentialStore> = match &credential {
        Some(path) => Arc::new(FileCredentialStore::open(path)?),
        None => Arc::new(MemoryCredentialStore::new()),
    };
    let auth = Arc::new(SimAuthProvider::new(approve_after));
    // Lets a credential saved by an earlier run validate again.
    if let Some(saved) = store.get()? {
        auth.approve_token(&saved.issued_device_token);
    }
    let channel = Arc::new(LoopbackChannel::new());

    let handle = SessionOrchestrator::spawn(config, link.clone(), auth, store, channel.clone());

    let mut notices = handle.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                SessionNotice::PairingCode { code, .. } => {
                    println!("Pairing code: {} (approved after {} polls)", code, approve_after)
                }
                other => println!("Notice: {:?}", other),
            }
        }
    });

    let mut feed = channel.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = feed.recv().await {
            println!("{}", message.to_json());
        }
    });

    // Resting heart rate with slow variation, like a sensor on a still wearer.
    let sensor = link.clone();
    tokio::spawn(async move {
        let mut tick: u32 = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let t = tick as f64;
            let current = f64::from(bpm) + (t * 0.05).sin() * 3.0 + (t * 0.1).cos() * 1.5;
            let current = current.clamp(40.0, 180.0);
            sensor.push_heart_rate(current.round() as i32);
            if intervals {
                let beat = 60_000.0 / current;
                sensor.push_intervals(vec![
                    beat + (t * 0.7).sin() * 25.0,
                    beat - (t * 0.3).cos() * 20.0,
                ]);
            }
            tick = tick.wrapping_add(1);
        }
    });

    handle.start_scan()?;

    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    let last = handle.snapshot();
    handle.shutdown()?;
    handle.stopped().await;
    println!("{}", serde_json::to_string_pretty(&last)?);
    Ok(())
}

async fn pair(auth_url: &str, credential_path: &Path, config: &SessionConfig) -> Result<()> {
    let auth = HttpAuthProvider::new(auth_url);
    let store = FileCredentialStore::open(credential_path)?;

    let ticket = auth.start_pairing().await?;
    println!("Enter pairing code {} to confirm this device", ticket.code);

    let status = loop {
        tokio::time::sleep(config.pairing_poll_interval).await;
        match auth.poll_pairing(&ticket.device_token).await {
            Ok(status) if status.authenticated => break status,
            Ok(_) => log::debug!("Pairing not confirmed yet"),
            Err(e) => log::warn!("Pairing poll failed: {}", e),
        }
        if chrono::Utc::now().timestamp() > ticket.expires_at {
            bail!("pairing code {} expired", ticket.code);
        }
    };

    let credential = SessionCredential {
        subject_id: status.subject_id()?,
        session_token: status.session_token,
        device_code: status.device_code,
        app_id: status.app_id,
        issued_device_token: ticket.device_token,
        expires_at_epoch_seconds: chrono::Utc::now().timestamp()
            + config.credential_ttl.as_secs() as i64,
        bound_device_id: None,
        bound_device_name: None,
    };
    store.save(&credential)?;
    println!(
        "Paired with subject {}, credential saved to {}",
        credential.subject_id,
        credential_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_loaded_config() {
        let cli = Cli::try_parse_from([
            "vagal",
            "simulate",
            "--window-capacity",
            "60",
            "--scan-timeout-secs",
            "10",
            "--emit-interval-ms",
            "250",
        ])
        .unwrap();
        let Commands::Simulate { overrides, .. } = cli.cmd else {
            panic!("expected simulate");
        };

        let mut config = SessionConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.window_capacity, 60);
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert_eq!(config.emit_interval, Duration::from_millis(250));
        // Unset flags leave the loaded values alone.
        assert_eq!(config.pairing_poll_interval, Duration::from_secs(5));
        assert_eq!(config.sample_rate_hz, DEFAULT_SAMPLE_RATE_HZ);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = SessionConfig::default();
        config.window_capacity = 45;
        ConfigOverrides::default().apply(&mut config);
        assert_eq!(config.window_capacity, 45);
    }
}
