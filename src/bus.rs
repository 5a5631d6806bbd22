//! System bus signal subscriptions.
//!
//! Each target owns one connection and one match rule. A pump task moves
//! matching messages into a bounded queue so a slow consumer (a target
//! waiting on a unit job) never stalls bus I/O. When the queue is full the
//! pump waits, so signals are delayed but never dropped or reordered.

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zbus::zvariant::{OwnedValue, Structure};
use zbus::{Connection, MatchRule, Message, MessageStream, OwnedMatchRule};

use crate::domain::{RawSignal, SignalFilter};

/// Ordered stream of signals for one target.
#[async_trait]
pub trait SignalSource: Send {
    /// Get the next signal, or `None` once the subscription is gone.
    async fn next_signal(&mut self) -> Option<RawSignal>;
}

#[async_trait]
impl SignalSource for mpsc::Receiver<RawSignal> {
    async fn next_signal(&mut self) -> Option<RawSignal> {
        self.recv().await
    }
}

/// Errors establishing a subscription.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Could not connect to the system D-Bus: {0}")]
    Connect(#[source] zbus::Error),

    #[error("Invalid match rule {filter}: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: zbus::Error,
    },

    #[error("Failed to listen for {filter} signals: {source}")]
    AddMatch {
        filter: String,
        #[source]
        source: zbus::Error,
    },
}

/// Open a dedicated system bus connection.
pub async fn connect_system() -> Result<Connection, BusError> {
    Connection::system().await.map_err(BusError::Connect)
}

/// Signals matching one filter, fed by a background pump task.
pub struct BusSignalSource {
    rx: mpsc::Receiver<RawSignal>,
    pump: JoinHandle<()>,
}

impl BusSignalSource {
    /// Register `filter` on `conn` and start pumping matches.
    pub async fn subscribe(
        conn: &Connection,
        filter: &SignalFilter,
        capacity: usize,
    ) -> Result<Self, BusError> {
        let rule = match_rule(filter)?;
        let stream = MessageStream::for_match_rule(rule, conn, Some(capacity))
            .await
            .map_err(|source| BusError::AddMatch {
                filter: filter.to_string(),
                source,
            })?;

        debug!("Subscribed to {}", filter);

        let (tx, rx) = mpsc::channel(capacity);
        let pump = tokio::spawn(pump(stream, tx));

        Ok(Self { rx, pump })
    }
}

#[async_trait]
impl SignalSource for BusSignalSource {
    async fn next_signal(&mut self) -> Option<RawSignal> {
        self.rx.recv().await
    }
}

impl Drop for BusSignalSource {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Build a signal match rule from a filter.
fn match_rule(filter: &SignalFilter) -> Result<OwnedMatchRule, BusError> {
    let invalid = |source| BusError::InvalidFilter {
        filter: filter.to_string(),
        source,
    };

    let mut builder = MatchRule::builder().msg_type(zbus::message::Type::Signal);
    if let Some(ref sender) = filter.sender {
        builder = builder.sender(sender.as_str()).map_err(invalid)?;
    }
    if let Some(ref path) = filter.path {
        builder = builder.path(path.as_str()).map_err(invalid)?;
    }
    if let Some(ref interface) = filter.interface {
        builder = builder.interface(interface.as_str()).map_err(invalid)?;
    }
    if let Some(ref member) = filter.member {
        builder = builder.member(member.as_str()).map_err(invalid)?;
    }

    Ok(builder.build().into())
}

async fn pump(mut stream: MessageStream, tx: mpsc::Sender<RawSignal>) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Bus stream error: {}", e);
                continue;
            }
        };

        let signal = raw_signal(&msg);
        trace!(
            "Received {}.{} on {} ({} args)",
            signal.interface,
            signal.member,
            signal.path,
            signal.args.len()
        );

        if tx.send(signal).await.is_err() {
            // Consumer is gone
            return;
        }
    }

    warn!("Bus signal stream ended");
}

fn raw_signal(msg: &Message) -> RawSignal {
    let header = msg.header();
    let path = header.path().map(ToString::to_string).unwrap_or_default();
    let interface = header
        .interface()
        .map(ToString::to_string)
        .unwrap_or_default();
    let member = header.member().map(ToString::to_string).unwrap_or_default();

    RawSignal::new(path, interface, member, decode_args(msg))
}

/// Decode the body into positional values. An empty or undecodable body
/// yields no arguments.
fn decode_args(msg: &Message) -> Vec<OwnedValue> {
    match msg.body().deserialize::<Structure<'_>>() {
        Ok(body) => body
            .into_fields()
            .into_iter()
            .filter_map(|value| value.try_to_owned().ok())
            .collect(),
        Err(e) => {
            trace!("Signal body not decoded: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_filter() -> SignalFilter {
        SignalFilter {
            sender: None,
            path: Some("/org/freedesktop/login1".to_string()),
            interface: Some("org.freedesktop.login1.Manager".to_string()),
            member: Some("PrepareForSleep".to_string()),
        }
    }

    #[test]
    fn test_match_rule_from_filter() {
        let rule = match_rule(&sleep_filter()).unwrap();
        let rendered = rule.to_string();
        assert!(rendered.contains("type='signal'"));
        assert!(rendered.contains("path='/org/freedesktop/login1'"));
        assert!(rendered.contains("interface='org.freedesktop.login1.Manager'"));
        assert!(rendered.contains("member='PrepareForSleep'"));
        assert!(!rendered.contains("sender="));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let filter = SignalFilter {
            path: Some("not a path".to_string()),
            ..SignalFilter::default()
        };
        let err = match_rule(&filter).unwrap_err();
        assert!(matches!(err, BusError::InvalidFilter { .. }));

        let filter = SignalFilter {
            member: Some("Bad.Member".to_string()),
            ..SignalFilter::default()
        };
        assert!(match_rule(&filter).is_err());
    }

    #[test]
    fn test_prepare_for_sleep_message_decoded() {
        let msg = Message::signal(
            "/org/freedesktop/login1",
            "org.freedesktop.login1.Manager",
            "PrepareForSleep",
        )
        .unwrap()
        .build(&(true,))
        .unwrap();

        let signal = raw_signal(&msg);
        assert_eq!(signal.path, "/org/freedesktop/login1");
        assert_eq!(signal.interface, "org.freedesktop.login1.Manager");
        assert_eq!(signal.member, "PrepareForSleep");
        assert_eq!(signal.args.len(), 1);
        assert_eq!(signal.args[0].downcast_ref::<bool>().unwrap(), true);
    }

    #[test]
    fn test_multiple_args_keep_position() {
        let msg = Message::signal(
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            "JobRemoved",
        )
        .unwrap()
        .build(&(7u32, "sleep.target", "done"))
        .unwrap();

        let signal = raw_signal(&msg);
        assert_eq!(signal.args.len(), 3);
        assert_eq!(signal.args[0].downcast_ref::<u32>().unwrap(), 7);
        let unit = String::try_from(signal.args[1].try_clone().unwrap()).unwrap();
        assert_eq!(unit, "sleep.target");
        let result = String::try_from(signal.args[2].try_clone().unwrap()).unwrap();
        assert_eq!(result, "done");
    }

    #[test]
    fn test_empty_body_has_no_args() {
        let msg = Message::signal(
            "/org/freedesktop/login1/session/_31",
            "org.freedesktop.login1.Session",
            "Lock",
        )
        .unwrap()
        .build(&())
        .unwrap();

        let signal = raw_signal(&msg);
        assert_eq!(signal.path, "/org/freedesktop/login1/session/_31");
        assert_eq!(signal.member, "Lock");
        assert!(signal.args.is_empty());
    }

    #[tokio::test]
    async fn test_channel_source_preserves_order() {
        let (tx, mut rx) = mpsc::channel(2);
        let producer = tokio::spawn(async move {
            for member in ["Lock", "Unlock", "Lock"] {
                tx.send(RawSignal::new("/s", "i", member, vec![]))
                    .await
                    .unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(signal) = rx.next_signal().await {
            seen.push(signal.member);
        }
        producer.await.unwrap();

        assert_eq!(seen, vec!["Lock", "Unlock", "Lock"]);
    }
}
