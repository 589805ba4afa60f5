use std::path::PathBuf;

use anyhow::Context;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "overlook.toml";

#[derive(Debug, Default)]
pub struct Args {
    pub config_path: PathBuf,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    pub audio: bool,
    pub mic: bool,
    pub capture: bool,
}

pub enum Command {
    Run(Args),
    Help,
    Version,
}

pub fn print_help() {
    println!("overlook - KVM-over-IP stream client");
    println!();
    println!("USAGE:");
    println!("    overlook [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>      TOML configuration file [default: overlook.toml]");
    println!("    --url <URL>          Janus WebSocket URL (default: https://HOST:PORT/janus/ws)");
    println!("    --host <HOST>        Device hostname or IP");
    println!("    --port <PORT>        Device HTTPS port [default: 443]");
    println!(
        "    --token <TOKEN>      Device auth_token cookie (prefer OVERLOOK_AUTH_TOKEN env)"
    );
    println!("    --audio              Request the device's audio track");
    println!("    --mic                Send the local microphone");
    println!("    --capture            Keep the latest frame for snapshot consumers");
    println!("    -V, --version        Print version and exit");
    println!("    -h, --help           Print this help and exit");
    println!();
    println!("While running, type 'r' + Enter to reconnect.");
}

pub fn parse_args() -> anyhow::Result<Command> {
    let token_env = std::env::var("OVERLOOK_AUTH_TOKEN").ok();
    parse_from(std::env::args().skip(1), token_env)
}

pub(crate) fn parse_from(
    args: impl IntoIterator<Item = String>,
    token_env: Option<String>,
) -> anyhow::Result<Command> {
    let args: Vec<String> = args.into_iter().collect();
    let mut parsed = Args {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        ..Default::default()
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => return Ok(Command::Version),
            "-h" | "--help" => return Ok(Command::Help),
            "--config" => {
                i += 1;
                parsed.config_path = args.get(i).context("Missing --config value")?.into();
            }
            "--url" => {
                i += 1;
                parsed.url = Some(args.get(i).context("Missing --url value")?.clone());
            }
            "--host" => {
                i += 1;
                parsed.host = Some(args.get(i).context("Missing --host value")?.clone());
            }
            "--port" => {
                i += 1;
                parsed.port = Some(
                    args.get(i)
                        .context("Missing --port value")?
                        .parse()
                        .context("Invalid --port value")?,
                );
            }
            "--token" => {
                // Visible in /proc; OVERLOOK_AUTH_TOKEN takes precedence
                i += 1;
                parsed.auth_token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--audio" => parsed.audio = true,
            "--mic" => parsed.mic = true,
            "--capture" => parsed.capture = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    if let Some(token) = token_env.filter(|t| !t.is_empty()) {
        parsed.auth_token = Some(token);
    }

    Ok(Command::Run(parsed))
}
