//! Order lifecycle engine for the two-sided grid.
//!
//! The engine owns one slot per side. Each slot moves through
//! Absent -> Pending -> Live, and back to Absent when the resting order
//! fills or cancels. A terminal fill on either side triggers the grid
//! step: cancel the opposite order, then re-center both sides on the fill
//! price. Fill events are deduplicated by exchange order id so stream
//! replays cannot double-step the grid.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    book::OrderBook,
    errors::EngineError,
    rest::{ExchangeApi, OrderRequest},
    types::{ClientIdGen, ClientOrderId, Order, OrderStatus, Side},
    ws::OrderUpdate,
};

use super::{config::GridConfig, policy::GridPolicy};

#[derive(Debug, Clone, Default, PartialEq)]
enum SlotState {
    #[default]
    Absent,
    /// Placement sent, acknowledgement not yet recorded.
    Pending(ClientOrderId),
    Live(Order),
}

impl SlotState {
    fn live_order(&self) -> Option<&Order> {
        match self {
            SlotState::Live(order) => Some(order),
            _ => None,
        }
    }

    fn owns(&self, exchange_id: &str, client_id: Option<ClientOrderId>) -> bool {
        match self {
            SlotState::Absent => false,
            SlotState::Pending(pending) => client_id == Some(*pending),
            SlotState::Live(order) => {
                order.exchange_id.as_deref() == Some(exchange_id)
                    || (client_id.is_some() && client_id == Some(order.client_id))
            }
        }
    }
}

pub struct GridEngine {
    exchange: Arc<dyn ExchangeApi>,
    policy: GridPolicy,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    id_gen: ClientIdGen,
    buy: SlotState,
    sell: SlotState,
    applied_fills: HashSet<String>,
}

impl GridEngine {
    pub fn new(config: &GridConfig, exchange: Arc<dyn ExchangeApi>) -> Self {
        Self {
            exchange,
            policy: GridPolicy::new(config),
            symbol: config.symbol.clone(),
            base_asset: config.base_asset().to_string(),
            quote_asset: config.quote_asset().to_string(),
            id_gen: ClientIdGen::new(config.client_id_prefix.clone()),
            buy: SlotState::Absent,
            sell: SlotState::Absent,
            applied_fills: HashSet::new(),
        }
    }

    pub fn live_order(&self, side: Side) -> Option<&Order> {
        self.slot(side).live_order()
    }

    fn slot(&self, side: Side) -> &SlotState {
        match side {
            Side::Bid => &self.buy,
            Side::Ask => &self.sell,
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut SlotState {
        match side {
            Side::Bid => &mut self.buy,
            Side::Ask => &mut self.sell,
        }
    }

    /// Places the initial pair straddling the book mid price.
    pub async fn place_initial(&mut self, book: &OrderBook) -> Result<(), EngineError> {
        let mid = book.mid_price()?;
        info!(mid, "placing initial grid orders");
        self.place_both(mid, book).await
    }

    /// Applies one private stream event to the grid state. The book is
    /// consulted to keep re-centered prices from crossing the spread.
    pub async fn handle_order_update(
        &mut self,
        update: &OrderUpdate,
        book: &OrderBook,
    ) -> Result<(), EngineError> {
        if update.symbol != self.symbol {
            debug!(symbol = %update.symbol, "ignoring update for foreign symbol");
            return Ok(());
        }

        match update.status {
            OrderStatus::Filled => self.handle_fill(update, book).await,
            OrderStatus::Cancelled => {
                self.clear_owned(update);
                Ok(())
            }
            OrderStatus::New => {
                self.promote_pending(update);
                Ok(())
            }
            OrderStatus::Unknown => {
                // Partial fills and states we do not track; the order is
                // still resting so the slot stays live.
                debug!(event = %update.event, id = %update.exchange_id, "unhandled order state");
                Ok(())
            }
        }
    }

    async fn handle_fill(
        &mut self,
        update: &OrderUpdate,
        book: &OrderBook,
    ) -> Result<(), EngineError> {
        if self.applied_fills.contains(&update.exchange_id) {
            debug!(id = %update.exchange_id, "replayed fill, already applied");
            return Ok(());
        }

        let side = update.side;
        if !self.slot(side).owns(&update.exchange_id, update.client_id) {
            // A fill for an order this instance does not track, e.g. one
            // placed manually on the same account. Corrected state comes
            // from our own orders only.
            warn!(id = %update.exchange_id, %side, "fill for untracked order, skipping");
            return Ok(());
        }

        self.applied_fills.insert(update.exchange_id.clone());
        *self.slot_mut(side) = SlotState::Absent;
        info!(%side, price = update.price, quantity = update.fill_quantity, "order filled");

        self.cancel_side(side.opposite()).await?;
        self.place_both(update.price, book).await
    }

    /// Marks the slot absent when one of our orders is cancelled, whether
    /// by us or out-of-band.
    fn clear_owned(&mut self, update: &OrderUpdate) {
        let side = update.side;
        if self.slot(side).owns(&update.exchange_id, update.client_id) {
            debug!(id = %update.exchange_id, %side, "order cancelled");
            *self.slot_mut(side) = SlotState::Absent;
        }
    }

    /// Acknowledgement handling. A pending slot is promoted to live; an
    /// acceptance the engine has no record of means our view diverged, so
    /// the slot is overwritten from the server-reported data.
    fn promote_pending(&mut self, update: &OrderUpdate) {
        let side = update.side;
        match self.slot(side) {
            SlotState::Live(order) if self.slot(side).owns(&update.exchange_id, update.client_id) => {
                // Already recorded from the REST response.
                debug!(id = ?order.exchange_id, %side, "acceptance for known order");
                return;
            }
            SlotState::Pending(client_id) if update.client_id == Some(*client_id) => {}
            _ => {
                // Our view diverged from the server's; the server is
                // authoritative, so adopt its state.
                warn!(
                    id = %update.exchange_id,
                    %side,
                    "acceptance for an order not in pending state, adopting server state"
                );
            }
        }
        *self.slot_mut(side) = SlotState::Live(Order {
            client_id: update.client_id.unwrap_or_default(),
            exchange_id: Some(update.exchange_id.clone()),
            side,
            price: update.price,
            quantity: update.quantity,
            status: OrderStatus::New,
        });
    }

    async fn cancel_side(&mut self, side: Side) -> Result<(), EngineError> {
        let exchange_id = match self.slot(side).live_order() {
            Some(order) => order.exchange_id.clone(),
            None => None,
        };
        if let Some(exchange_id) = exchange_id {
            self.exchange.cancel_order(&self.symbol, &exchange_id).await?;
            debug!(%side, id = %exchange_id, "cancelled opposite order");
        }
        *self.slot_mut(side) = SlotState::Absent;
        Ok(())
    }

    async fn place_both(&mut self, reference: f64, book: &OrderBook) -> Result<(), EngineError> {
        let best_bid = book.best_bid().ok().map(|level| level.price);
        let best_ask = book.best_ask().ok().map(|level| level.price);
        self.place_side(Side::Bid, self.policy.next_buy_price(reference, best_bid))
            .await?;
        self.place_side(Side::Ask, self.policy.next_sell_price(reference, best_ask))
            .await
    }

    /// Places one order if the policy admits it. Band violations,
    /// insufficient balance and exchange rejections all skip the side and
    /// leave it absent; the grid continues one-sided until a later fill
    /// moves the reference back. Sides never block each other.
    async fn place_side(&mut self, side: Side, price: f64) -> Result<(), EngineError> {
        if self.slot(side).live_order().is_some() {
            return Err(EngineError::Inconsistency(format!(
                "{side} slot already live while placing at {price}"
            )));
        }

        let balances = self.exchange.balances().await?;
        let asset = match side {
            Side::Bid => self.quote_asset.as_str(),
            Side::Ask => self.base_asset.as_str(),
        };
        let available = balances.get(asset).copied().unwrap_or(0.0);

        if let Err(reason) = self.policy.admit(side, price, available) {
            warn!(%side, price, %reason, "skipping order");
            return Ok(());
        }

        let client_id = self.id_gen.next_id();
        let request = OrderRequest::limit_gtc(
            client_id,
            self.symbol.clone(),
            side,
            self.policy.order_quantity(),
            price,
        );
        *self.slot_mut(side) = SlotState::Pending(client_id);

        match self.exchange.place_order(&request).await {
            Ok(order) => {
                info!(%side, price, id = ?order.exchange_id, "order placed");
                *self.slot_mut(side) = SlotState::Live(order);
            }
            Err(err) => {
                warn!(%side, price, %err, "placement failed, side stays empty");
                *self.slot_mut(side) = SlotState::Absent;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::mock::MockExchange;
    use crate::types::PriceLevel;

    fn config() -> GridConfig {
        GridConfig::from_toml_str(
            r#"
            symbol = "SOL_USDC"
            order_quantity = 0.5
            gap_ratio = 0.001
            min_price = 50.0
            max_price = 400.0
            client_id_prefix = "7"
            "#,
        )
        .unwrap()
    }

    fn engine_with(balances: &[(&str, f64)]) -> (GridEngine, Arc<MockExchange>) {
        let exchange = Arc::new(MockExchange::with_balances(balances));
        let engine = GridEngine::new(&config(), exchange.clone());
        (engine, exchange)
    }

    fn book_at(bid: f64, ask: f64) -> OrderBook {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            vec![PriceLevel::new(bid, 1.0)],
            vec![PriceLevel::new(ask, 1.0)],
            1,
        );
        book
    }

    fn fill(side: Side, exchange_id: &str, price: f64) -> OrderUpdate {
        OrderUpdate {
            event: "orderFill".to_string(),
            exchange_id: exchange_id.to_string(),
            client_id: None,
            symbol: "SOL_USDC".to_string(),
            side,
            status: OrderStatus::Filled,
            price,
            quantity: 0.5,
            fill_quantity: 0.5,
        }
    }

    #[tokio::test]
    async fn test_initial_placement_straddles_mid() {
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book_at(99.95, 100.05)).await.unwrap();

        let placed = exchange.placed.lock().await;
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].side, Side::Bid);
        assert_eq!(placed[0].price, 99.90);
        assert_eq!(placed[1].side, Side::Ask);
        assert_eq!(placed[1].price, 100.10);
        drop(placed);

        assert!(engine.live_order(Side::Bid).is_some());
        assert!(engine.live_order(Side::Ask).is_some());
    }

    #[tokio::test]
    async fn test_fill_cancels_opposite_and_recenters() {
        let mut book = book_at(99.95, 100.05);
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();
        let buy_id = engine
            .live_order(Side::Bid)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();
        let sell_id = engine
            .live_order(Side::Ask)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();

        // Market traded down through the buy; the book moved with it.
        book.apply_diff(
            2,
            &[PriceLevel::new(99.95, 0.0), PriceLevel::new(99.85, 1.0)],
            &[PriceLevel::new(100.05, 0.0), PriceLevel::new(99.95, 1.0)],
        );
        engine
            .handle_order_update(&fill(Side::Bid, &buy_id, 99.90), &book)
            .await
            .unwrap();

        let cancelled = exchange.cancelled.lock().await;
        assert_eq!(cancelled.as_slice(), &[sell_id]);
        drop(cancelled);

        let placed = exchange.placed.lock().await;
        assert_eq!(placed.len(), 4);
        // 99.90 * 0.999 and 99.90 * 1.001, on the configured tick.
        assert_eq!(placed[2].price, 99.80);
        assert_eq!(placed[3].price, 100.0);
    }

    #[tokio::test]
    async fn test_recentered_sell_joins_stale_ask() {
        // The book has not moved since the fill, so the naive sell at
        // 100.0 would cross under the resting 100.05 ask; it joins it.
        let book = book_at(99.95, 100.05);
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();
        let buy_id = engine
            .live_order(Side::Bid)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();

        engine
            .handle_order_update(&fill(Side::Bid, &buy_id, 99.90), &book)
            .await
            .unwrap();

        let placed = exchange.placed.lock().await;
        assert_eq!(placed[3].side, Side::Ask);
        assert_eq!(placed[3].price, 100.05);
    }

    #[tokio::test]
    async fn test_replayed_fill_is_a_no_op() {
        let book = book_at(99.95, 100.05);
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();
        let buy_id = engine
            .live_order(Side::Bid)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();

        let event = fill(Side::Bid, &buy_id, 99.90);
        engine.handle_order_update(&event, &book).await.unwrap();
        let placed_after_first = exchange.placed.lock().await.len();
        let cancelled_after_first = exchange.cancelled.lock().await.len();

        engine.handle_order_update(&event, &book).await.unwrap();
        assert_eq!(exchange.placed.lock().await.len(), placed_after_first);
        assert_eq!(exchange.cancelled.lock().await.len(), cancelled_after_first);
    }

    #[tokio::test]
    async fn test_fill_for_untracked_order_is_skipped() {
        let book = book_at(99.95, 100.05);
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();

        engine
            .handle_order_update(&fill(Side::Bid, "someone-elses-order", 99.0), &book)
            .await
            .unwrap();

        assert_eq!(exchange.placed.lock().await.len(), 2);
        assert!(exchange.cancelled.lock().await.is_empty());
        assert!(engine.live_order(Side::Bid).is_some());
    }

    #[tokio::test]
    async fn test_insufficient_quote_skips_buy_but_places_sell() {
        // 0.5 SOL at ~99.9 needs ~50 USDC; give less than that.
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 10.0)]);
        engine.place_initial(&book_at(99.95, 100.05)).await.unwrap();

        let placed = exchange.placed.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Ask);
        drop(placed);

        assert!(engine.live_order(Side::Bid).is_none());
        assert!(engine.live_order(Side::Ask).is_some());
    }

    #[tokio::test]
    async fn test_buy_below_band_floor_is_skipped() {
        // Mid just above the band floor: the buy lands below 50.
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book_at(50.0, 50.02)).await.unwrap();

        let placed = exchange.placed.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Ask);
    }

    #[tokio::test]
    async fn test_sell_above_band_cap_is_skipped() {
        // Wide gap against a tight cap: the sell at 110 exceeds 105 and
        // is skipped while the buy at 90 still goes out.
        let config = GridConfig::from_toml_str(
            r#"
            symbol = "SOL_USDC"
            order_quantity = 0.5
            gap_ratio = 0.1
            min_price = 50.0
            max_price = 105.0
            "#,
        )
        .unwrap();
        let exchange = Arc::new(MockExchange::with_balances(&[("SOL", 10.0), ("USDC", 1000.0)]));
        let mut engine = GridEngine::new(&config, exchange.clone());

        engine.place_initial(&book_at(99.95, 100.05)).await.unwrap();

        let placed = exchange.placed.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Bid);
        assert_eq!(placed[0].price, 90.0);
        drop(placed);
        assert!(engine.live_order(Side::Ask).is_none());
    }

    #[tokio::test]
    async fn test_external_cancel_clears_slot() {
        let book = book_at(99.95, 100.05);
        let (mut engine, _exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();
        let sell_id = engine
            .live_order(Side::Ask)
            .and_then(|o| o.exchange_id.clone())
            .unwrap();

        let update = OrderUpdate {
            event: "orderCancelled".to_string(),
            exchange_id: sell_id,
            client_id: None,
            symbol: "SOL_USDC".to_string(),
            side: Side::Ask,
            status: OrderStatus::Cancelled,
            price: 100.10,
            quantity: 0.5,
            fill_quantity: 0.0,
        };
        engine.handle_order_update(&update, &book).await.unwrap();
        assert!(engine.live_order(Side::Ask).is_none());
    }

    #[tokio::test]
    async fn test_unexpected_acceptance_adopts_server_state() {
        let book = book_at(99.95, 100.05);
        let (mut engine, _exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);

        let update = OrderUpdate {
            event: "orderAccepted".to_string(),
            exchange_id: "server-knows-best".to_string(),
            client_id: Some(ClientOrderId::new(7000777)),
            symbol: "SOL_USDC".to_string(),
            side: Side::Bid,
            status: OrderStatus::New,
            price: 99.0,
            quantity: 0.5,
            fill_quantity: 0.0,
        };
        engine.handle_order_update(&update, &book).await.unwrap();

        let adopted = engine.live_order(Side::Bid).unwrap();
        assert_eq!(adopted.exchange_id.as_deref(), Some("server-knows-best"));
        assert_eq!(adopted.price, 99.0);
    }

    #[tokio::test]
    async fn test_foreign_symbol_is_ignored() {
        let book = book_at(99.95, 100.05);
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        engine.place_initial(&book).await.unwrap();

        let mut update = fill(Side::Bid, "1", 99.90);
        update.symbol = "ETH_USDC".to_string();
        engine.handle_order_update(&update, &book).await.unwrap();

        assert_eq!(exchange.placed.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_placement_does_not_block_other_side() {
        let (mut engine, exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        *exchange.fail_placement_for.lock().await = Some(Side::Bid);

        engine.place_initial(&book_at(99.95, 100.05)).await.unwrap();
        assert!(engine.live_order(Side::Bid).is_none());
        assert!(engine.live_order(Side::Ask).is_some());
        assert_eq!(exchange.placed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_book_fails_initial_placement() {
        let (mut engine, _exchange) = engine_with(&[("SOL", 10.0), ("USDC", 1000.0)]);
        let result = engine.place_initial(&OrderBook::new()).await;
        assert!(matches!(result, Err(EngineError::EmptyBook(_))));
    }
}
