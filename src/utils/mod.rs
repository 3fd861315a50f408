pub mod logging;
pub mod sequence_reset;
pub mod setting;
