//! Session orchestration: bring the exchange state to a known baseline,
//! seed the book, stream events into the engine, and fail closed.
//!
//! There is deliberately no reconnect path. Any transport close, decode
//! failure, or engine error ends the session; the runner then cancels
//! every resting order for the symbol before returning, so no order is
//! left unattended.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    book::OrderBook,
    errors::SessionError,
    rest::{BpxClient, ExchangeApi},
    signer::InstructionSigner,
    ws::{StreamClient, StreamConfig, StreamConnection, StreamEvent},
};

use super::{config::GridConfig, engine::GridEngine};

enum LoopControl {
    Continue,
    /// Server ended the stream; carries the close reason when one was sent.
    Stop(Option<String>),
}

pub struct GridRunner {
    config: GridConfig,
    client: Arc<BpxClient>,
    signer: Arc<dyn InstructionSigner>,
}

impl GridRunner {
    pub fn new(config: GridConfig, signer: Arc<dyn InstructionSigner>) -> Self {
        let client = BpxClient::with_base_url(signer.clone(), config.rest_url.clone())
            .retry_policy(config.max_retries, config.retry_delay());
        Self {
            config,
            client: Arc::new(client),
            signer,
        }
    }

    /// Runs one full session. Returns when the stream ends or a fatal
    /// error occurs, after the cancel-all cleanup.
    pub async fn run(self) -> Result<(), SessionError> {
        let result = self.session().await;
        if let Err(err) = &result {
            error!(%err, "session failed, cancelling all orders");
        } else {
            info!("session ended, cancelling all orders");
        }
        if let Err(cleanup) = self.client.cancel_all_orders(&self.config.symbol).await {
            error!(%cleanup, "cleanup cancel-all failed, orders may still be resting");
        }
        result
    }

    async fn session(&self) -> Result<(), SessionError> {
        self.wait_until_operational().await?;

        // Start from a clean slate: any order left over from a previous
        // run would desynchronize the grid.
        self.client.cancel_all_orders(&self.config.symbol).await?;

        let mut book = OrderBook::new();
        let snapshot = self.client.depth(&self.config.symbol).await?;
        let (bids, asks, seq) = snapshot.into_levels().map_err(SessionError::Rest)?;
        book.apply_snapshot(bids, asks, seq);
        info!(seq, "order book seeded");

        let stream = StreamClient::new(StreamConfig {
            url: self.config.ws_url.clone(),
            symbol: self.config.symbol.clone(),
        })
        .map_err(SessionError::Ws)?;
        let mut connection = stream.connect(self.signer.as_ref()).await.map_err(SessionError::Ws)?;
        info!(symbol = %self.config.symbol, "stream subscribed");

        let exchange: Arc<dyn ExchangeApi> = self.client.clone();
        let mut engine = GridEngine::new(&self.config, exchange);
        engine.place_initial(&book).await?;

        self.event_loop(&mut connection, &mut book, &mut engine).await
    }

    async fn event_loop(
        &self,
        connection: &mut StreamConnection,
        book: &mut OrderBook,
        engine: &mut GridEngine,
    ) -> Result<(), SessionError> {
        loop {
            match connection.next_event().await {
                Ok(Some(event)) => match apply_event(book, engine, event).await? {
                    LoopControl::Continue => {}
                    LoopControl::Stop(reason) => {
                        return Err(SessionError::Fatal(format!(
                            "stream closed by server: {}",
                            reason.unwrap_or_else(|| "no close frame".to_string())
                        )));
                    }
                },
                Ok(None) => {
                    return Err(SessionError::Fatal("stream ended without close frame".into()))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn wait_until_operational(&self) -> Result<(), SessionError> {
        loop {
            let status = self.client.status().await?;
            if status.is_ok() {
                return Ok(());
            }
            info!(
                status = %status.status,
                message = status.message.as_deref().unwrap_or(""),
                "exchange not operational, waiting"
            );
            tokio::time::sleep(self.config.retry_delay()).await;
        }
    }
}

async fn apply_event(
    book: &mut OrderBook,
    engine: &mut GridEngine,
    event: StreamEvent,
) -> Result<LoopControl, SessionError> {
    match event {
        StreamEvent::Depth(diff) => {
            book.apply_diff(diff.last_update_id, &diff.bids, &diff.asks);
            Ok(LoopControl::Continue)
        }
        StreamEvent::Order(update) => {
            engine.handle_order_update(&update, book).await?;
            Ok(LoopControl::Continue)
        }
        StreamEvent::Pong => Ok(LoopControl::Continue),
        StreamEvent::Ignored(raw) => {
            debug!(%raw, "ignoring stream frame");
            Ok(LoopControl::Continue)
        }
        StreamEvent::Closed(info) => {
            warn!(?info, "stream close frame received");
            Ok(LoopControl::Stop(info.map(|info| {
                format!("code {} {}", info.code, info.reason)
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::mock::MockExchange;
    use crate::types::{OrderStatus, PriceLevel, Side};
    use crate::ws::{CloseInfo, DepthDiff, OrderUpdate};

    fn test_engine(exchange: Arc<MockExchange>) -> GridEngine {
        let config = GridConfig::from_toml_str(
            r#"
            symbol = "SOL_USDC"
            order_quantity = 0.5
            gap_ratio = 0.001
            min_price = 50.0
            max_price = 400.0
            "#,
        )
        .unwrap();
        GridEngine::new(&config, exchange)
    }

    #[tokio::test]
    async fn test_depth_event_updates_book() {
        let exchange = Arc::new(MockExchange::with_balances(&[("SOL", 1.0), ("USDC", 100.0)]));
        let mut engine = test_engine(exchange);
        let mut book = OrderBook::new();
        book.apply_snapshot(
            vec![PriceLevel::new(100.0, 1.0)],
            vec![PriceLevel::new(101.0, 1.0)],
            1,
        );

        let event = StreamEvent::Depth(DepthDiff {
            symbol: "SOL_USDC".to_string(),
            first_update_id: 2,
            last_update_id: 2,
            bids: vec![PriceLevel::new(100.5, 1.0)],
            asks: vec![],
        });
        let control = apply_event(&mut book, &mut engine, event).await.unwrap();
        assert!(matches!(control, LoopControl::Continue));
        assert_eq!(book.best_bid().unwrap().price, 100.5);
    }

    #[tokio::test]
    async fn test_order_event_reaches_engine() {
        let exchange = Arc::new(MockExchange::with_balances(&[("SOL", 10.0), ("USDC", 1000.0)]));
        let mut engine = test_engine(exchange.clone());
        let mut book = OrderBook::new();
        book.apply_snapshot(
            vec![PriceLevel::new(99.95, 1.0)],
            vec![PriceLevel::new(100.05, 1.0)],
            1,
        );
        engine.place_initial(&book).await.unwrap();
        let buy_id = engine
            .live_order(Side::Bid)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();

        let event = StreamEvent::Order(OrderUpdate {
            event: "orderFill".to_string(),
            exchange_id: buy_id,
            client_id: None,
            symbol: "SOL_USDC".to_string(),
            side: Side::Bid,
            status: OrderStatus::Filled,
            price: 99.90,
            quantity: 0.5,
            fill_quantity: 0.5,
        });
        apply_event(&mut book, &mut engine, event).await.unwrap();
        assert_eq!(exchange.placed.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn test_close_frame_stops_the_loop() {
        let exchange = Arc::new(MockExchange::new());
        let mut engine = test_engine(exchange);
        let mut book = OrderBook::new();

        let event = StreamEvent::Closed(Some(CloseInfo {
            code: 1001,
            reason: "going away".to_string(),
        }));
        let control = apply_event(&mut book, &mut engine, event).await.unwrap();
        assert!(matches!(control, LoopControl::Stop(Some(_))));
    }
}
