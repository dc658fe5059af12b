//! Exchange log: every handled request/response pair, raw and decoded.
//! Recording never blocks; a slow or absent consumer cannot stall a handler.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{Packet, Request, Response};

#[derive(Debug, Clone)]
pub struct Exchange {
    /// Name of the local peer that handled or issued the exchange.
    pub peer: String,
    pub request: Request,
    pub response: Response,
    pub decoded_request: Option<Packet>,
    pub decoded_response: Option<Packet>,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    tx: Option<mpsc::UnboundedSender<Exchange>>,
}

impl Journal {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Exchange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Journal that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn record(&self, exchange: Exchange) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(exchange);
        }
    }
}

/// Default consumer: writes each exchange at debug level until every sender is gone.
pub fn spawn_tracing_consumer(mut rx: mpsc::UnboundedReceiver<Exchange>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(exchange) = rx.recv().await {
            let kind = exchange
                .decoded_request
                .as_ref()
                .and_then(|p| p.message().ok())
                .map(|m| m.kind.tag())
                .unwrap_or("unknown");
            tracing::debug!(
                peer = %exchange.peer,
                kind,
                session = exchange.request.session.as_deref().unwrap_or("-"),
                code = ?exchange.response.code,
                request_len = exchange.request.data.len(),
                response_len = exchange.response.data.as_ref().map_or(0, String::len),
                "exchange"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Code;

    fn exchange() -> Exchange {
        Exchange {
            peer: "srv".into(),
            request: Request::default(),
            response: Response::status(Code::Ok),
            decoded_request: None,
            decoded_response: None,
        }
    }

    #[tokio::test]
    async fn records_reach_consumer() {
        let (journal, mut rx) = Journal::channel();
        journal.clone().record(exchange());
        let got = rx.recv().await.unwrap();
        assert_eq!(got.peer, "srv");
        assert_eq!(got.response.code, Code::Ok);
    }

    #[test]
    fn record_without_consumer_does_not_block() {
        let (journal, rx) = Journal::channel();
        drop(rx);
        journal.record(exchange());
        Journal::disabled().record(exchange());
    }
}
