pub mod book;
pub mod errors;
pub mod grid;
pub mod rest;
pub mod signer;
pub mod types;
pub mod ws;

pub use book::{DiffOutcome, OrderBook};
pub use errors::{
    EmptyBookError, EngineError, PolicyError, RestError, SessionError, SignerError, WsError,
};
pub use grid::{GridConfig, GridEngine, GridPolicy, GridRunner};
pub use rest::{BpxClient, ExchangeApi, OrderRequest};
pub use signer::{Ed25519Signer, InstructionSigner, SignedHeaders, SubscribeSignature};
pub use types::{ClientIdGen, ClientOrderId, Order, OrderStatus, PriceLevel, Side};
pub use ws::{DepthDiff, OrderUpdate, StreamClient, StreamConfig, StreamConnection, StreamEvent};
