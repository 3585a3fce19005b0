use std::fmt;

use tokio::sync::mpsc;

use super::Value;

/// Returned by [`Port::send`] when the other end is gone; hands the value back.
#[derive(Debug, thiserror::Error)]
#[error("port closed")]
pub struct PortClosed(pub Value);

/// One end of a bidirectional value pipe.
///
/// Values sent on one end arrive on the other. Dropping an end closes it:
/// the peer's `recv` returns `None` once drained.
pub struct Port {
    tx: mpsc::UnboundedSender<Value>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Port {
    pub fn pair() -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Port { tx: a_tx, rx: b_rx },
            Port { tx: b_tx, rx: a_rx },
        )
    }

    pub fn send(&self, value: impl Into<Value>) -> Result<(), PortClosed> {
        self.tx.send(value.into()).map_err(|e| PortClosed(e.0))
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        (self.tx, self.rx)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_duplex() {
        let (mut a, mut b) = Port::pair();
        a.send("ping").unwrap();
        b.send("pong").unwrap();

        assert_eq!(b.recv().await.unwrap().as_str(), Some("ping"));
        assert_eq!(a.recv().await.unwrap().as_str(), Some("pong"));
    }

    #[tokio::test]
    async fn closed_port_returns_value() {
        let (a, b) = Port::pair();
        drop(b);

        assert!(a.is_closed());
        let PortClosed(value) = a.send(7).unwrap_err();
        assert_eq!(value.as_i64(), Some(7));
    }
}
