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

use std::{
    io::{self, Error, ErrorKind},
    path::PathBuf,
    sync::Arc,
};

use crossbeam_channel as channel;
use parking_lot::Mutex;

/// How to reach the broker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Comma separated server URLs. `tls://` forces TLS, `user:pass@` and
    /// `token@` authenticate.
    pub servers: String,
    /// Client name announced in `CONNECT`.
    pub name: String,
    /// Reconnect attempts per server once connected.
    pub max_reconnects: usize,
    /// Extra PEM root certificates for TLS servers.
    pub tls_ca_cert: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            servers: crate::DEFAULT_URL.to_string(),
            name: "nats-tail".to_string(),
            max_reconnects: 60,
            tls_ca_cert: None,
        }
    }
}

/// A connection with a single live subscription.
///
/// Messages arrive on [`Tail::messages`] in delivery order. [`Tail::closed`]
/// fires once the connection is gone for good, either because every
/// reconnect attempt failed or because [`Tail::close`] was called.
pub struct Tail {
    connection: nats::Connection,
    subscription: nats::Subscription,
    subject: String,
    last_error: Arc<Mutex<Option<String>>>,
    closed: channel::Receiver<()>,
}

impl std::fmt::Debug for Tail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tail")
            .field("subject", &self.subject)
            .field("client_id", &self.connection.client_id())
            .finish()
    }
}

impl Tail {
    /// Connects, subscribes to `subject` and waits for the server to
    /// acknowledge it.
    ///
    /// Fails if no server accepts the connection or if the server rejects
    /// the subscription, e.g. with a permissions violation.
    ///
    /// ```no_run
    /// use nats_tail::{Tail, TransportConfig};
    ///
    /// let tail = Tail::start(&TransportConfig::default(), "docker.>")?;
    /// for msg in tail.messages() {
    ///     println!("{}", msg.subject);
    /// }
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn start(config: &TransportConfig, subject: &str) -> io::Result<Tail> {
        validate_subject(subject)?;

        let last_error = Arc::new(Mutex::new(None));
        let (closed_sender, closed) = channel::bounded(1);

        let mut options = nats::Options::new()
            .with_name(&config.name)
            .max_reconnects(config.max_reconnects)
            .error_callback({
                let last_error = last_error.clone();
                move |err| {
                    log::warn!("server error: {}", err);
                    *last_error.lock() = Some(err.to_string());
                }
            })
            .disconnect_callback(|| log::warn!("disconnected, reconnecting"))
            .reconnect_callback(|| log::info!("reconnected"))
            .close_callback(move || {
                log::debug!("connection closed");
                closed_sender.try_send(()).ok();
            });
        if let Some(path) = &config.tls_ca_cert {
            options = options.add_root_certificate(path);
        }

        let connection = options.connect(config.servers.as_str()).map_err(|err| {
            let msg = err.to_string();
            Error::new(
                classify(err.kind(), &msg),
                format!("Can't connect: {}", msg),
            )
        })?;

        let subscription = connection.subscribe(subject)?;
        connection.flush()?;

        let tail = Tail {
            connection,
            subscription,
            subject: subject.to_string(),
            last_error,
            closed,
        };
        if let Some(err) = tail.last_error() {
            return Err(err);
        }

        log::debug!("subscribed to {} as client {}", subject, tail.connection.client_id());
        Ok(tail)
    }

    /// The subscribed subject pattern.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receiver of matching messages, usable with `select!`.
    pub fn messages(&self) -> &channel::Receiver<nats::Message> {
        self.subscription.receiver()
    }

    /// Receives once when the connection has been closed for good.
    pub fn closed(&self) -> &channel::Receiver<()> {
        &self.closed
    }

    /// The most recent error the server reported, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .as_ref()
            .map(|msg| Error::new(classify(ErrorKind::Other, msg), msg.clone()))
    }

    /// Unsubscribes and closes the connection.
    pub fn close(self) {
        self.connection.close();
    }
}

/// Server `-ERR` replies only carry text; authorization and permission
/// failures get their own kind.
fn classify(kind: ErrorKind, msg: &str) -> ErrorKind {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("authorization") || lower.contains("permissions") {
        ErrorKind::PermissionDenied
    } else {
        kind
    }
}

/// Checks a subscription subject for the mistakes a server would reject.
fn validate_subject(subject: &str) -> io::Result<()> {
    let invalid = |reason: &str| {
        Err(Error::new(
            ErrorKind::InvalidInput,
            format!("invalid subject {:?}: {}", subject, reason),
        ))
    };

    if subject.is_empty() {
        return invalid("subject is empty");
    }
    if subject.chars().any(char::is_whitespace) {
        return invalid("subject contains whitespace");
    }

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        match token {
            "" => return invalid("subject contains an empty token"),
            ">" if tokens.peek().is_some() => {
                return invalid("`>` must be the last token");
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_subjects() {
        for subject in &["foo", "foo.bar", "foo.*", "*.bar", ">", "docker.>", "a.*.c"] {
            assert!(validate_subject(subject).is_ok(), "{}", subject);
        }
    }

    #[test]
    fn invalid_subjects() {
        for subject in &["", "foo bar", "foo\tbar", "foo..bar", ".foo", "foo.", "foo.>.bar"] {
            let err = validate_subject(subject).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{:?}", subject);
        }
    }

    #[test]
    fn server_errors_map_to_kinds() {
        assert_eq!(
            classify(ErrorKind::Other, "Authorization Violation"),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify(
                ErrorKind::Other,
                "Permissions Violation for Subscription to \"foo\""
            ),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify(ErrorKind::Other, "Unknown Protocol Operation"),
            ErrorKind::Other
        );
        assert_eq!(
            classify(ErrorKind::ConnectionRefused, "connection refused"),
            ErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.servers, crate::DEFAULT_URL);
        assert_eq!(config.name, "nats-tail");
        assert_eq!(config.max_reconnects, 60);
        assert!(config.tls_ca_cert.is_none());
    }
}
