//! applet-launcher: run applets under applet-host supervision until they exit
//! or the launcher is told to stop.

use std::process;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use applet_host::{
    APPLET_HOST_VERSION, AppletConfig, AppletHandle, AppletMessage, AppletSet, AppletState,
    CoreDispatcher, Dispatcher, Invocation,
};

const USAGE: &str = "Usage: applet-launcher [--stop-timeout <secs>] [--] <program> [args...] [-- <program> [args...]]...";

#[derive(Debug, PartialEq)]
struct LaunchArgs {
    stop_timeout: Option<Duration>,
    invocations: Vec<Invocation>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let launch = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <program>              Applet binary, followed by its arguments");
            eprintln!();
            eprintln!("Options:");
            eprintln!(
                "  --stop-timeout <secs>  Seconds to wait for an applet to exit after stop before SIGTERM [default: wait forever]"
            );
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  APPLET_LOG   debug|info|warn|error [default: info] (RUST_LOG overrides)");
            eprintln!("  LOG_FORMAT   set to 'json' for JSON logs");
            process::exit(2);
        }
    };

    init_tracing();

    match run(launch).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<LaunchArgs, String> {
    let mut stop_timeout = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--stop-timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--stop-timeout requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --stop-timeout value: {raw}"))?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(format!("invalid --stop-timeout value: {raw}"));
                }
                stop_timeout = Some(Duration::from_secs_f64(secs));
            }
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                i += 1;
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => break,
        }
        i += 1;
    }

    let rest = &args[i.min(args.len())..];
    if rest.is_empty() {
        return Err("missing required argument: <program>".to_string());
    }

    let mut invocations = Vec::new();
    for group in rest.split(|arg| arg == "--") {
        let Some((program, tail)) = group.split_first() else {
            return Err("empty applet command".to_string());
        };
        invocations.push(Invocation::new(program).args(tail));
    }

    Ok(LaunchArgs {
        stop_timeout,
        invocations,
    })
}

/// Initialize tracing with APPLET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("APPLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "applet_host={level},applet_launcher={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Routes the two lifecycle kinds onto the applet's hooks and logs everything.
struct LauncherDispatcher;

#[async_trait]
impl Dispatcher for LauncherDispatcher {
    async fn dispatch(&self, applet: &AppletHandle, message: AppletMessage) {
        match message.kind.as_str() {
            "ready" => applet.mark_running(),
            "failed" => {
                let reason = message
                    .get("reason")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unspecified");
                applet.mark_failed(reason);
            }
            _ => {}
        }
        CoreDispatcher.dispatch(applet, message).await;
    }
}

/// Returns true when every applet ended in `Stopped`.
async fn run(launch: LaunchArgs) -> anyhow::Result<bool> {
    info!("applet-launcher {}", APPLET_HOST_VERSION);

    let mut config = AppletConfig::new();
    if let Some(timeout) = launch.stop_timeout {
        config = config.with_stop_timeout(timeout);
    }
    let set = AppletSet::new(config);

    for invocation in launch.invocations {
        let label = invocation.to_string();
        set.register(invocation, LauncherDispatcher)
            .with_context(|| format!("failed to register applet `{label}`"))?;
    }

    for err in set.start_all() {
        warn!(error = %err, "Failed to start applet");
    }

    tokio::select! {
        _ = shutdown_signal() => set.stop_all(),
        _ = set.wait_all() => {}
    }

    let finished = set.wait_all().await;
    for (id, state) in &finished {
        info!(applet_id = %id, %state, "Applet finished");
    }

    Ok(finished
        .iter()
        .all(|(_, state)| *state == AppletState::Stopped))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, stopping applets...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping applets...");
        }
    }
}
