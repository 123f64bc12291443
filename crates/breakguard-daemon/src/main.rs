//! BreakGuard - Main entry point
//!
//! Runs the enforcement loop and the one-shot enrollment and maintenance
//! commands.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use breakguard_core::{
    clock::elapsed_between, BreakGuardConfig, BudgetFile, Clock, CroppedFaceDetector, DeviceRef,
    Factors, FaceVerifier, FrameSource, GateConfig, LockController, NoPowerSwitch,
    PowerCredential, PowerDispatch, SecretRecord, SecretStore, StateFile, SystemClock,
    TimerEngine, TotpEngine,
};
use breakguard_daemon::{
    authorize, config, console, service, CommandCamera, CommandSwitch, ConsoleDisplay,
    ConsoleNotifier, Enforcer, TokioPowerDispatch,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use qrcode::{render::unicode, QrCode};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Attempts at typing the code shown by a freshly enrolled authenticator
const ENROLLMENT_CONFIRM_TRIES: usize = 3;

#[derive(Parser)]
#[command(name = "breakguard")]
#[command(about = "Enforce regular work breaks behind TOTP and face verification", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $BREAKGUARD_CONFIG or <config dir>/breakguard/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Start break enforcement (default)
    Run,

    /// Enroll a new authenticator app, replacing any previous one
    /// (requires a code from the previous one)
    EnrollTotp,

    /// Enroll your face from the camera, replacing any previous template
    /// (requires a valid code)
    EnrollFace,

    /// Show the saved timer state without changing it
    Status,

    /// Remove the enrolled face template (requires a valid code)
    ClearFace,

    /// Store the monitor power switch in the secret store (requires a
    /// valid code)
    SetPowerDevice {
        /// Device reference passed to power_command
        device: String,

        /// Also prompt for an access token for the switch
        #[arg(long)]
        with_token: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "breakguard_daemon=info,breakguard_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::config_path);
    let config = config::load_or_create(&config_path)
        .with_context(|| format!("loading config from {:?}", config_path))?;
    let data_dir = config::data_dir(&config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, &data_dir).await,
        Commands::EnrollTotp => enroll_totp(&config, &data_dir),
        Commands::EnrollFace => enroll_face(&config, &data_dir).await,
        Commands::Status => show_status(&config, &data_dir),
        Commands::ClearFace => clear_face(&config, &data_dir),
        Commands::SetPowerDevice { device, with_token } => {
            set_power_device(&config, &data_dir, device, with_token)
        }
    }
}

async fn run(config: BreakGuardConfig, data_dir: &Path) -> Result<()> {
    info!("Starting BreakGuard v{}", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SecretStore::open(data_dir)?;
    let timer = TimerEngine::recover(config.timer_config()?, StateFile::new(data_dir), clock.now());

    let camera: Option<Arc<dyn FrameSource>> = match &config.camera_command {
        Some(program) if config.face_verification_enabled => Some(Arc::new(CommandCamera::new(program))),
        None if config.face_verification_enabled => {
            warn!("No camera_command configured, face verification is unavailable");
            None
        }
        _ => None,
    };
    let verifier = camera.is_some().then(|| face_verifier(&config)).transpose()?;
    let factors = Arc::new(Factors::load(&store, TotpEngine::default(), verifier));

    let (sender, commands) = service::channel();
    let power: Arc<dyn PowerDispatch> = match (&config.power_command, PowerCredential::load(&store)) {
        (Some(program), Ok(Some(credential))) => Arc::new(TokioPowerDispatch::spawn(
            Arc::new(CommandSwitch::new(program).with_token(credential.token())),
            credential.device().clone(),
            config.power_timeout(),
            sender.clone(),
        )),
        (Some(_), Ok(None)) => {
            warn!("power_command is set but no device is stored; run `breakguard set-power-device`");
            Arc::new(NoPowerSwitch)
        }
        (Some(_), Err(e)) => {
            warn!("Power credential unreadable, monitor power disabled: {}", e);
            Arc::new(NoPowerSwitch)
        }
        (None, _) => Arc::new(NoPowerSwitch),
    };

    let controller = LockController::start(
        timer,
        factors,
        config.gate_config()?,
        Arc::new(ConsoleDisplay),
        Arc::new(ConsoleNotifier),
        power,
        clock.now(),
    );

    let enforcer = Enforcer::new(controller, clock, camera, sender, commands);
    let handle = enforcer.handle();
    let enforcer_task = tokio::spawn(enforcer.run());
    tokio::spawn(console::run(handle.clone()));

    info!("BreakGuard started");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    handle.shutdown().await?;
    let controller = enforcer_task.await?;
    info!("Shut down in phase {:?}", controller.phase());
    Ok(())
}

fn enroll_totp(config: &BreakGuardConfig, data_dir: &Path) -> Result<()> {
    let store = SecretStore::open(data_dir)?;
    require_code(config, &store, data_dir)?;
    let engine = TotpEngine::default();
    let provisioning = engine.enroll(&store)?;

    let qr = QrCode::new(provisioning.uri.as_bytes())
        .map_err(|e| anyhow::anyhow!("QR encoding failed: {:?}", e))?;
    let image = qr
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();

    println!("Scan this code with your authenticator app:\n");
    println!("{}\n", image);
    println!("Or enter the secret manually: {}", provisioning.display_secret());
    println!("Account: {} ({})\n", provisioning.label, provisioning.issuer);

    for _ in 0..ENROLLMENT_CONFIRM_TRIES {
        let code = prompt("Enter the code shown by your app: ")?;
        match engine.confirm_enrollment(&store, &code, Utc::now()) {
            Ok(()) => {
                println!("Authenticator enrolled.");
                return Ok(());
            }
            Err(e) => println!("{}", e),
        }
    }
    bail!("Enrollment was not confirmed; run `breakguard enroll-totp` again")
}

fn show_status(config: &BreakGuardConfig, data_dir: &Path) -> Result<()> {
    let file = StateFile::new(data_dir);
    match file.load() {
        Ok(Some(state)) => {
            println!("Phase:        {:?}", state.phase);
            println!("Worked:       {}s of {}s", state.elapsed.as_secs(), state.lock_at().as_secs());
            println!("Snoozes used: {}/{}", state.snoozes_used, config.max_snooze_count);
            println!(
                "Saved:        {} ({}s ago)",
                state.last_persisted_at,
                elapsed_between(state.last_persisted_at, Utc::now()).as_secs()
            );
        }
        Ok(None) => println!("No saved timer state"),
        Err(e) => println!("Timer state unreadable: {}", e),
    }
    if file.has_lock_marker() {
        println!("Lock marker present: the next start resumes a break");
    }
    Ok(())
}

async fn enroll_face(config: &BreakGuardConfig, data_dir: &Path) -> Result<()> {
    let Some(program) = &config.camera_command else {
        bail!("Set camera_command in the config before enrolling a face");
    };
    let store = SecretStore::open(data_dir)?;
    require_code(config, &store, data_dir)?;

    println!("Look at the camera and hold still...");
    face_verifier(config)?
        .enroll_from(&CommandCamera::new(program), &store)
        .await?;
    println!("Face enrolled.");
    Ok(())
}

fn clear_face(config: &BreakGuardConfig, data_dir: &Path) -> Result<()> {
    let store = SecretStore::open(data_dir)?;
    if !store.contains(SecretRecord::FaceTemplate) {
        println!("No face template enrolled");
        return Ok(());
    }

    require_code(config, &store, data_dir)?;
    store.remove(SecretRecord::FaceTemplate)?;
    println!("Face template removed");
    Ok(())
}

fn set_power_device(config: &BreakGuardConfig, data_dir: &Path, device: String, with_token: bool) -> Result<()> {
    let store = SecretStore::open(data_dir)?;
    require_code(config, &store, data_dir)?;

    let token = if with_token {
        Some(prompt("Access token for the switch: ")?)
    } else {
        None
    };
    PowerCredential::new(DeviceRef::new(device), token).save(&store)?;
    println!("Power device stored");
    if config.power_command.is_none() {
        println!("Set power_command in the config to switch the monitor");
    }
    Ok(())
}

fn face_verifier(config: &BreakGuardConfig) -> Result<FaceVerifier> {
    Ok(FaceVerifier::new(Arc::new(CroppedFaceDetector), config.face_verifier_config()?))
}

/// Ask for a valid code before changing enrolled factors
///
/// Failures are remembered in the data directory, so rerunning the
/// command continues the same attempt budget and lockout.
fn require_code(config: &BreakGuardConfig, store: &SecretStore, data_dir: &Path) -> Result<()> {
    if !store.contains(SecretRecord::TotpSecret) {
        return Ok(());
    }
    let gate_config = GateConfig {
        face_enabled: false,
        ..config.gate_config()?
    };
    let factors = Arc::new(Factors::load(store, TotpEngine::default(), None));
    authorize(&gate_config, factors, &BudgetFile::new(data_dir), &SystemClock, |rejected| {
        if let Some(e) = rejected {
            println!("{}", e);
        }
        Ok(prompt("Enter your authenticator code: ")?)
    })?;
    Ok(())
}

fn prompt(message: &str) -> io::Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no input"));
    }
    Ok(line.trim().to_string())
}
