pub mod config;
pub mod error;
pub mod events;
pub mod gpio;
pub mod poller;
pub mod sysfs;

pub use config::{AppConfig, Direction, Edge, LineConfig, WatchOptions};
pub use error::GpioError;
pub use events::{EdgeEvent, EventBus};
pub use gpio::{Line, Listener, WatchPolicy};
pub use poller::{Epoll, Interest, MockReactor, Poller, PollerOp, ReadyHandler, Timers};
pub use sysfs::Sysfs;
