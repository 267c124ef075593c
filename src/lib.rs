//! Roundbet backend library
//!
//! Timed BTC up/down prediction rounds: oracle pricing, round lifecycle, ledger persistence,
//! pari-mutuel settlement and the keeper that drives transitions for clients.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod game;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod price;
pub mod round;
pub mod settlement;
pub mod sync;
pub mod units;

pub use error::{ErrorClass, GameError};
pub use game::PredictionGame;
