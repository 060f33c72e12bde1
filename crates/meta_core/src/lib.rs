pub mod api;
pub mod change;
pub mod codec;
pub mod error;
pub mod ids;
pub mod model;
pub mod time;

pub use api::*;
pub use change::*;
pub use codec::*;
pub use error::{MetaError, MetaResult};
pub use ids::*;
pub use model::*;
pub use time::*;
