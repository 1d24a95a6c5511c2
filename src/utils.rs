use tracing::{debug, info, warn};

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundCamera {
    pub index: usize,
    pub name: String,
}

/// Enumerate V4L2 video nodes that can capture.
#[cfg(target_os = "linux")]
pub fn list_cameras() -> Vec<FoundCamera> {
    use v4l::capability::Flags;
    use v4l::Device;

    v4l::context::enum_devices()
        .into_iter()
        .filter(|node| {
            Device::new(node.index())
                .and_then(|dev| dev.query_caps())
                .map(|caps| caps.capabilities.contains(Flags::VIDEO_CAPTURE))
                .unwrap_or(false)
        })
        .map(|node| FoundCamera {
            index: node.index(),
            name: node.name().unwrap_or_default(),
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn list_cameras() -> Vec<FoundCamera> {
    Vec::new()
}

/// Resolve a camera name to its device index.
pub fn camera_index_by_name(name: &str) -> Option<usize> {
    let found = list_cameras()
        .into_iter()
        .find(|camera| camera.name == name)
        .map(|camera| camera.index);
    debug!(name, ?found, "resolved camera name");
    found
}

/// Serial port names currently known to the OS.
pub fn available_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!(error = %e, "serial port enumeration failed");
            Vec::new()
        }
    }
}

/// Pin the calling thread to one CPU core. Failure is logged and ignored.
pub fn pin_current_thread(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        info!(core, "capture thread pinned");
    } else {
        warn!(core, "could not pin capture thread");
    }
}

/// Set the process scheduling niceness (unix only).
#[cfg(unix)]
pub fn set_process_nice(nice: i32) {
    // SAFETY: setpriority only reads its integer arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc == 0 {
        info!(nice, "process priority set");
    } else {
        warn!(nice, error = %std::io::Error::last_os_error(), "could not set process priority");
    }
}

#[cfg(not(unix))]
pub fn set_process_nice(nice: i32) {
    debug!(nice, "process priority is only adjusted on unix");
}
