pub mod commands;
mod prompt;

pub use commands::{Cli, Commands};

use anyhow::{bail, Context};
use console::style;
use dialoguer::Confirm;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use prompt::PromptingCredentials;
use rust_i18n::t;
use ssh_console::models::{
    format_bytes, AuthMethod, ConnectionLog, HostConfig, LogLevel, TunnelRule,
};
use ssh_console::services::config_service::{check_port_conflicts, AppSettings, ConfigService};
use ssh_console::services::exec_service::{
    Completion, ExecEvent, ExecRequest, ExecStream, OutputStream,
};
use ssh_console::services::log_service::LogService;
use ssh_console::services::ssh_service::SshService;
use ssh_console::services::Session;
use ssh_console::state::AppState;
use ssh_console::utils::i18n;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Execute one parsed command line
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match cli.config_dir {
        Some(dir) => ConfigService::with_dir(dir)?,
        None => ConfigService::new()?,
    };
    let settings = config.load_settings()?;
    i18n::set_language(cli.lang.as_deref().or(Some(settings.language.as_str())));

    match cli.command {
        Commands::List => list_hosts(&config),
        Commands::Show { host } => show_host(&config, &host),
        Commands::Add {
            name,
            host,
            port,
            username,
            key,
            default_keys,
            passphrase,
            auto_reconnect,
        } => {
            let auth = match key {
                Some(path) => AuthMethod::public_key(path, passphrase),
                None if default_keys => AuthMethod::DefaultKeys {
                    passphrase_required: passphrase,
                },
                None => AuthMethod::Password,
            };
            let host = HostConfig::new(name, host, username)
                .with_port(port)
                .with_auth(auth)
                .with_auto_reconnect(auto_reconnect);
            config.save_host(&host)?;
            println!(
                "{}",
                style(t!("cli.host_added", name = host.name, id = host.id)).green()
            );
            Ok(())
        }
        Commands::Delete { host, yes } => delete_host(&config, &host, yes),
        Commands::Forward {
            host,
            local_port,
            remote_host,
            remote_port,
            bind,
            auto_start,
            description,
        } => {
            let host = find_host(&config, &host)?;
            let mut rule = TunnelRule::new(local_port, remote_host, remote_port)
                .with_bind_address(bind.unwrap_or_else(|| settings.default_bind_address.clone()))
                .with_auto_start(auto_start);
            if let Some(description) = description {
                rule = rule.with_description(description);
            }

            let mut rules = host.tunnels.clone();
            rules.push(rule.clone());
            check_port_conflicts(&rules)?;
            config.update_tunnel_rules(&host.id, rules)?;
            println!(
                "{}",
                style(t!("cli.rule_added", rule = rule.display(), host = host.name)).green()
            );
            Ok(())
        }
        Commands::Connect {
            host,
            auto_reconnect,
        } => {
            let host = find_host(&config, &host)?;
            connect(config, &settings, host, auto_reconnect).await
        }
        Commands::Exec {
            host,
            command,
            script,
            workdir,
        } => {
            let host = find_host(&config, &host)?;
            let request = match script {
                Some(path) => read_script(&path)?,
                None => ExecRequest::command(command.join(" ")),
            };
            let request = match workdir {
                Some(dir) => request.in_directory(dir),
                None => request,
            };
            exec(config, &settings, host, request).await
        }
        Commands::Tail { host, path } => {
            let host = find_host(&config, &host)?;
            tail(config, &settings, host, &path).await
        }
    }
}

fn find_host(config: &ConfigService, key: &str) -> anyhow::Result<HostConfig> {
    match config.find_host(key)? {
        Some(host) => Ok(host),
        None => bail!(t!("cli.host_not_found", host = key).to_string()),
    }
}

fn read_script(path: &Path) -> anyhow::Result<ExecRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    Ok(ExecRequest::script(&text))
}

fn list_hosts(config: &ConfigService) -> anyhow::Result<()> {
    let hosts = config.load_hosts()?;
    if hosts.is_empty() {
        println!("{}", t!("cli.no_hosts"));
        return Ok(());
    }

    for host in hosts {
        println!(
            "{}  {} - {}",
            style(host.id.as_str()).dim(),
            style(&host.name).bold(),
            host.display_name()
        );
    }
    Ok(())
}

fn show_host(config: &ConfigService, key: &str) -> anyhow::Result<()> {
    let host = find_host(config, key)?;
    println!("{}", style(&host.name).bold());
    println!("  id:             {}", host.id);
    println!("  address:        {}", host.display_name());
    println!("  auth:           {}", auth_label(&host.auth));
    println!("  auto-reconnect: {}", host.auto_reconnect);

    println!("{}", style(t!("cli.tunnels")).bold());
    if host.tunnels.is_empty() {
        println!("  {}", t!("cli.no_tunnels"));
    }
    for rule in &host.tunnels {
        let auto = if rule.auto_start { " [auto]" } else { "" };
        println!("  {}  {}{}", style(&rule.id).dim(), rule.display(), auto);
    }
    Ok(())
}

fn auth_label(auth: &AuthMethod) -> String {
    match auth {
        AuthMethod::Password => "password".to_string(),
        AuthMethod::PublicKey {
            private_key_path, ..
        } => format!("key {}", private_key_path.display()),
        AuthMethod::DefaultKeys { .. } => "default keys".to_string(),
    }
}

fn delete_host(config: &ConfigService, key: &str, yes: bool) -> anyhow::Result<()> {
    let host = find_host(config, key)?;
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(t!("cli.delete_confirm", name = host.name).to_string())
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    config.delete_host(&host.id)?;
    println!("{}", t!("cli.host_deleted", name = host.name));
    Ok(())
}

async fn open_state(config: ConfigService, settings: &AppSettings) -> AppState {
    let log = Arc::new(
        LogService::new(settings.status_log_capacity).with_file(config.status_log_file()),
    );
    let connector = Arc::new(SshService::new(
        settings.connect_timeout(),
        settings.keepalive_interval(),
    ));
    AppState::new(
        Arc::new(config),
        Arc::new(PromptingCredentials::new()),
        connector,
        log,
        settings,
    )
    .await
}

/// Echo status log entries to the terminal as they happen
fn print_status_log(log: &LogService) -> JoinHandle<()> {
    let mut entries = log.subscribe();
    tokio::spawn(async move {
        loop {
            match entries.recv().await {
                Ok(entry) => print_entry(&entry),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn print_entry(entry: &ConnectionLog) {
    let time = entry.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
    let message = match entry.level {
        LogLevel::Info => style(&entry.message).cyan(),
        LogLevel::Warning => style(&entry.message).yellow(),
        LogLevel::Error => style(&entry.message).red(),
    };
    println!("{} {}", style(time).dim(), message);
}

async fn connect_with_spinner(state: &AppState, host: &HostConfig) -> anyhow::Result<Session> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(t!("cli.connecting", host = host.display_name()).to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = state.connect_host(&host.id).await;
    spinner.finish_and_clear();
    Ok(result?)
}

async fn connect(
    config: ConfigService,
    settings: &AppSettings,
    host: HostConfig,
    auto_reconnect: bool,
) -> anyhow::Result<()> {
    let state = open_state(config, settings).await;
    let printer = print_status_log(&state.log);
    if auto_reconnect {
        state.set_auto_reconnect(&host.id, true).await;
    }

    let session = match connect_with_spinner(&state, &host).await {
        Ok(session) => session,
        Err(e) => {
            state.shutdown().await;
            printer.abort();
            return Err(e);
        }
    };

    for tunnel in session.tunnels().snapshot().await {
        let marker = if tunnel.active {
            style("●").green()
        } else {
            style("○").dim()
        };
        println!("  {} {}", marker, tunnel.rule.display());
    }
    println!("{}", style(t!("cli.press_ctrl_c")).dim());

    tokio::signal::ctrl_c().await?;
    println!("{}", t!("cli.disconnecting"));

    // The session may have been replaced by a reconnect
    if let Some(current) = state.session(&host.id).await {
        for tunnel in current.tunnels().snapshot().await {
            if tunnel.bytes_sent + tunnel.bytes_received > 0 {
                println!(
                    "  {}  ↑ {}  ↓ {}",
                    tunnel.rule.display(),
                    format_bytes(tunnel.bytes_sent),
                    format_bytes(tunnel.bytes_received)
                );
            }
        }
    }

    state.disconnect_host(&host.id).await;
    state.shutdown().await;
    printer.abort();
    Ok(())
}

/// Print a stream until it completes; Ctrl-C cancels it.
/// Returns the exit code the process should end with.
async fn print_stream(mut stream: ExecStream) -> i32 {
    let cancel = stream.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut code = 0;
    while let Some(event) = stream.next().await {
        match event {
            ExecEvent::Line(line) => match line.stream {
                OutputStream::Stdout => println!("{}", line.text),
                OutputStream::Stderr => eprintln!("{}", style(&line.text).red()),
            },
            ExecEvent::Completed(Completion::Finished {
                exit_status,
                failed_steps,
            }) => {
                if failed_steps > 0 {
                    eprintln!(
                        "{}",
                        style(t!("cli.failed_steps", count = failed_steps)).yellow()
                    );
                    code = 1;
                }
                if let Some(status) = exit_status.filter(|s| *s != 0) {
                    eprintln!("{}", style(t!("cli.exit_status", status = status)).dim());
                    code = i32::try_from(status).unwrap_or(1);
                }
            }
            ExecEvent::Completed(Completion::Cancelled) => {
                eprintln!("{}", style(t!("cli.cancelled")).yellow());
                code = 130;
            }
        }
    }

    interrupt.abort();
    code
}

async fn exec(
    config: ConfigService,
    settings: &AppSettings,
    host: HostConfig,
    request: ExecRequest,
) -> anyhow::Result<()> {
    let state = open_state(config, settings).await;
    let session = match connect_with_spinner(&state, &host).await {
        Ok(session) => session,
        Err(e) => {
            state.shutdown().await;
            return Err(e);
        }
    };

    let outcome = async {
        let executor = session.stream_executor().await?;
        let stream = executor.run(request).await?;
        anyhow::Ok(print_stream(stream).await)
    }
    .await;

    state.shutdown().await;
    let code = outcome?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn tail(
    config: ConfigService,
    settings: &AppSettings,
    host: HostConfig,
    path: &str,
) -> anyhow::Result<()> {
    let state = open_state(config, settings).await;
    let session = match connect_with_spinner(&state, &host).await {
        Ok(session) => session,
        Err(e) => {
            state.shutdown().await;
            return Err(e);
        }
    };

    let outcome = async {
        let tailer = session.log_tailer().await?;
        let stream = tailer.start(path).await?;
        println!("{}", style(t!("cli.tail_following", path = path)).dim());
        print_stream(stream).await;
        tailer.stop().await;
        anyhow::Ok(())
    }
    .await;

    state.shutdown().await;
    outcome
}
