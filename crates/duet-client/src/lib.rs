pub mod pipeline;
pub mod transport;
pub mod types;

pub use pipeline::{Endpoints, Pipeline, PipelineExit, StopSignal};
pub use transport::{bind_socket, LossSimulator, UnitReceiver, UnitSender};
pub use types::{PipelineConfig, PipelineStats, PipelineStatsSnapshot};
