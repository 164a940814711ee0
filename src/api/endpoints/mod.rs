pub mod alerts;
pub mod intake;
pub mod meta;
