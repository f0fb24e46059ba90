pub mod coordinator;
pub mod delivery;
pub mod drivers;
pub mod fanout;
pub mod ledger;
pub mod proximity;
pub mod retry;
pub mod settlement;
pub mod timers;
pub mod tracker;
