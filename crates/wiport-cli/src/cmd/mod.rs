pub mod journal;
pub mod rehearse;
