//! Graphics device discovery and hot-plug through udev.

use std::{io, path::PathBuf};

use calloop::{generic::Generic, Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use tracing::{debug, info, warn};

use crate::backend::{Backend, DeviceEvent};

fn is_card(device: &udev::Device) -> bool {
    let name = device.sysname().to_string_lossy();
    name.starts_with("card") && !name.contains('-')
}

/// All card nodes currently present, as `(device number, node)`.
pub fn enumerate_cards() -> io::Result<Vec<(u64, PathBuf)>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    let cards = enumerator
        .scan_devices()?
        .filter(is_card)
        .filter_map(|device| {
            let devnum = device.devnum()?;
            let path = device.devnode()?.to_path_buf();
            Some((devnum as u64, path))
        })
        .collect::<Vec<_>>();
    info!(cards = cards.len(), "Enumerated graphics devices");
    Ok(cards)
}

fn device_event(event: &udev::Event) -> Option<DeviceEvent> {
    let device = event.device();
    if !is_card(&device) {
        return None;
    }
    let device_id = device.devnum()? as u64;
    match event.event_type() {
        udev::EventType::Add => Some(DeviceEvent::Added {
            device_id,
            path: device.devnode()?.to_path_buf(),
        }),
        udev::EventType::Change => Some(DeviceEvent::Changed { device_id }),
        udev::EventType::Remove => Some(DeviceEvent::Removed { device_id }),
        _ => None,
    }
}

/// Forwards card hot-plug events to the backend.
pub fn insert_udev_source(handle: &LoopHandle<'static, Backend>) -> io::Result<RegistrationToken> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem("drm")?
        .listen()?;
    handle
        .insert_source(
            Generic::new(socket, Interest::READ, Mode::Level),
            |_, socket, backend| {
                for event in socket.as_ref().iter() {
                    match device_event(&event) {
                        Some(event) => {
                            debug!(?event, "udev event");
                            backend.handle_device_event(event);
                        }
                        None => continue,
                    }
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| {
            warn!("Unable to watch udev: {}", err.error);
            io::Error::other(err.error)
        })
}
