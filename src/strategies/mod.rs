pub mod levels;
pub mod martingale;
pub mod state;
pub mod traits;
