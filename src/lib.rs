pub mod args;
pub mod backend;
pub mod config;
pub mod damage;
pub mod device;
pub mod error;
pub mod gpu;
#[cfg(feature = "kms")]
pub mod kms;
pub mod multigpu;
pub mod observer;
pub mod output;
pub mod presenter;
pub mod region;
pub mod render_backend;
pub mod render_loop;
pub mod surface;
pub mod texture;
#[cfg(feature = "udev")]
pub mod udev;
pub mod vsync;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, DeviceEvent, OutputKey, Scene, ScreenInfo};
