//! Building blocks for [`clap`]-driven configs of the table store writer.

pub mod logging;
pub mod writer;
