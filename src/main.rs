// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, Error, ErrorKind, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use crossbeam_channel as channel;
use is_terminal::IsTerminal;
use structopt::StructOpt;

use nats_tail::display::{Engine, OutputFormat};
use nats_tail::{Tail, TransportConfig};

const USAGE: &str = "nats-tail [-s server] <subject>";

/// Tail the messages flowing through a NATS subject.
///
/// Use the tls scheme for TLS, e.g. nats-tail -s tls://demo.nats.io:4443 "docker.>"
#[derive(Debug, StructOpt)]
#[structopt(name = "nats-tail", usage = "nats-tail [-s server] <subject>")]
struct Config {
    /// The nats server URLs (separated by comma)
    #[structopt(short, long, default_value = "nats://127.0.0.1:4222")]
    server: String,

    /// Display output format: raw or docker-logs
    #[structopt(short, long, default_value = "raw")]
    output: OutputFormat,

    /// Display timestamp (docker-logs format)
    #[structopt(short, long)]
    timestamp: bool,

    /// Show nats-tail version
    #[structopt(short = "v", long)]
    show_version: bool,

    /// Colorize subjects: auto, always or never
    #[structopt(long, default_value = "auto")]
    color: ColorChoice,

    /// PEM file with root certificates to trust for TLS servers
    #[structopt(long, parse(from_os_str))]
    tlscacert: Option<PathBuf>,

    /// Client name announced to the server
    #[structopt(long, default_value = "nats-tail")]
    name: String,

    /// Reconnect attempts per server before giving up
    #[structopt(long, default_value = "60")]
    max_reconnects: usize,

    /// Subject to subscribe to, `*` and `>` wildcards allowed
    subject: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            other => Err(format!(
                "invalid color choice {:?}, expected auto, always or never",
                other
            )),
        }
    }
}

impl ColorChoice {
    fn enabled(self) -> bool {
        match self {
            ColorChoice::Auto => io::stdout().is_terminal(),
            ColorChoice::Always => true,
            ColorChoice::Never => false,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config = match Config::from_iter_safe(std::env::args_os()) {
        Ok(config) => config,
        Err(err) => {
            if wants_version(std::env::args_os().filter_map(|arg| arg.into_string().ok())) {
                print_version();
            }
            err.exit()
        }
    };

    if config.show_version {
        print_version();
    }

    if let Err(err) = run(config) {
        log::error!("{}", err);
        process::exit(1);
    }
}

/// The version flag wins even over arguments that do not parse.
fn wants_version(args: impl Iterator<Item = String>) -> bool {
    args.skip(1)
        .take_while(|arg| arg != "--")
        .any(|arg| arg == "-v" || arg == "--show-version")
}

fn print_version() -> ! {
    println!("nats-tail v{}", nats_tail::VERSION);
    process::exit(0);
}

fn run(config: Config) -> io::Result<()> {
    let subject = config
        .subject
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("Usage: {}", USAGE)))?;

    let transport = TransportConfig {
        servers: config.server,
        name: config.name,
        max_reconnects: config.max_reconnects,
        tls_ca_cert: config.tlscacert,
    };
    let tail = Tail::start(&transport, &subject)?;

    let mut engine = Engine::new(config.output, config.timestamp).with_color(config.color.enabled());

    log::info!("Listening on [{}]", subject);

    let (stop_sender, stop_receiver) = channel::bounded(1);
    ctrlc::set_handler(move || {
        stop_sender.try_send(()).ok();
    })
    .map_err(|err| Error::new(ErrorKind::Other, err))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    loop {
        channel::select! {
            recv(tail.messages()) -> msg => match msg {
                Ok(msg) => {
                    engine.render(&msg.subject, &msg.data, &mut out)?;
                    out.flush()?;
                }
                Err(_) => return Err(lost_connection()),
            },
            recv(tail.closed()) -> _ => return Err(lost_connection()),
            recv(stop_receiver) -> _ => break,
        }
    }

    log::info!("Shutting down");
    tail.close();
    Ok(())
}

fn lost_connection() -> Error {
    Error::new(
        ErrorKind::ConnectionAborted,
        "connection to the server was lost",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn defaults() {
        let config = Config::from_iter_safe(&["nats-tail", "docker.>"]).unwrap();
        assert_eq!(config.server, nats_tail::DEFAULT_URL);
        assert_eq!(config.output, OutputFormat::Raw);
        assert!(!config.timestamp);
        assert!(!config.show_version);
        assert_eq!(config.color, ColorChoice::Auto);
        assert_eq!(config.name, "nats-tail");
        assert_eq!(config.max_reconnects, 60);
        assert_eq!(config.subject.as_deref(), Some("docker.>"));
    }

    #[test]
    fn short_flags() {
        let config = Config::from_iter_safe(&[
            "nats-tail",
            "-s",
            "tls://demo.nats.io:4443",
            "-o",
            "docker-logs",
            "-t",
            "foo.*",
        ])
        .unwrap();
        assert_eq!(config.server, "tls://demo.nats.io:4443");
        assert_eq!(config.output, OutputFormat::DockerLogs);
        assert!(config.timestamp);
        assert_eq!(config.subject.as_deref(), Some("foo.*"));
    }

    #[test]
    fn unknown_output_format_is_accepted() {
        let config = Config::from_iter_safe(&["nats-tail", "-o", "xml", "foo"]).unwrap();
        assert_eq!(config.output, OutputFormat::Unsupported("xml".to_string()));
    }

    #[test]
    fn subject_is_optional_for_version() {
        let config = Config::from_iter_safe(&["nats-tail", "-v"]).unwrap();
        assert!(config.show_version);
        assert!(config.subject.is_none());
    }

    #[test]
    fn color_choice() {
        assert_eq!("always".parse::<ColorChoice>(), Ok(ColorChoice::Always));
        assert_eq!("never".parse::<ColorChoice>(), Ok(ColorChoice::Never));
        assert!("sometimes".parse::<ColorChoice>().is_err());
        assert!(ColorChoice::Always.enabled());
        assert!(!ColorChoice::Never.enabled());
        assert!(Config::from_iter_safe(&["nats-tail", "--color", "sometimes", "foo"]).is_err());
    }

    #[test]
    fn version_flag_detection() {
        assert!(wants_version(args(&["nats-tail", "--bogus", "-v"])));
        assert!(wants_version(args(&["nats-tail", "--show-version"])));
        assert!(wants_version(args(&["nats-tail", "-v", "-h"])));
        assert!(wants_version(args(&["nats-tail", "--help", "-v"])));
        assert!(!wants_version(args(&["nats-tail", "foo"])));
        assert!(!wants_version(args(&["nats-tail", "--", "-v"])));
    }
}
