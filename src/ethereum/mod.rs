pub mod game;
pub mod provider;
pub mod simulate;
pub mod utils;
