//! Snapshot save/load of the live-pipe set.
//!
//! Stream layout: a little-endian u32 live-pipe count, then one record per
//! pipe in identifier order. Each record is the big-endian u64 pipe
//! identifier, one marker byte (0 force-close, 1 state follows) and, for
//! marker 1, a length-prefixed state blob holding the service name, the
//! connect arguments and the service-defined bytes. The length prefix lets
//! a record that fails to load be skipped without disturbing its neighbors.

use std::io;
use std::sync::{Arc, Weak};

use hostpipe_logger::{debug, warn};
use hostpipe_pipe::{HostEndpoint, HwPipe, Service, ServicePipe};
use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{OpenFlags, PipeId};

use crate::manager::PipeManager;

impl PipeManager {
    /// Called once before a whole-VM save.
    pub fn guest_pre_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        for service in self.registry().services() {
            service.pre_save(writer)?;
        }
        Ok(())
    }

    /// Called once after a whole-VM save.
    pub fn guest_post_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        for service in self.registry().services() {
            service.post_save(writer)?;
        }
        Ok(())
    }

    /// Called once before a whole-VM load.
    pub fn guest_pre_load(&self, reader: &mut SnapshotReader<'_>) -> io::Result<()> {
        for service in self.registry().services() {
            service.pre_load(reader)?;
        }
        Ok(())
    }

    /// Called once after a whole-VM load.
    pub fn guest_post_load(&self, reader: &mut SnapshotReader<'_>) -> io::Result<()> {
        for service in self.registry().services() {
            service.post_load(reader)?;
        }
        Ok(())
    }

    /// Saves every live pipe. Pipes whose service cannot be restored are
    /// written with the force-close marker.
    pub fn guest_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        let slots = self.all_slots();
        debug_assert!(slots.len() <= u32::MAX as usize);
        writer.put_le32(slots.len() as u32)?;
        for (id, slot) in slots {
            writer.put_be64(id.value())?;
            let entry = slot.entry.lock();
            let mut blob = Vec::new();
            let mut has_state = false;
            if let HostEndpoint::Bound(pipe) = &entry.state {
                if let Some(service) = entry.service.as_ref().filter(|s| s.can_load()) {
                    let mut blob_writer = SnapshotWriter::new(&mut blob);
                    blob_writer.put_string(service.name())?;
                    blob_writer.put_string(entry.args.as_deref().unwrap_or(""))?;
                    pipe.on_save(&mut blob_writer)?;
                    has_state = true;
                }
            }
            if has_state {
                writer.put_byte(1)?;
                writer.put_sized(&blob)?;
            } else {
                writer.put_byte(0)?;
                debug!("pipe {} saved as force-close", id);
            }
        }
        Ok(())
    }

    /// Mirror of [`PipeManager::guest_save`]. `provide_hw` supplies the
    /// hardware endpoint the device recreated for each restored pipe.
    ///
    /// A record that fails to load is demoted to force-close: the pipe is
    /// inserted closed and a graceful close is scheduled on the deferred
    /// queue so the guest observes hangup at its next poll. Neighboring
    /// records continue loading.
    pub fn guest_load(
        &self,
        reader: &mut SnapshotReader<'_>,
        provide_hw: &mut dyn FnMut(PipeId) -> Weak<dyn HwPipe>,
    ) -> io::Result<Vec<PipeId>> {
        self.require_threading()
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.registry().freeze();
        let count = reader.get_le32()?;
        let mut loaded = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = PipeId::new(reader.get_be64()?);
            let marker = reader.get_byte()?;
            let hw = provide_hw(id);
            match marker {
                1 => {
                    let blob = reader.get_sized()?;
                    match self.load_record(id, &blob) {
                        Ok((pipe, service, args)) => {
                            self.bind_loaded(id, hw, OpenFlags::empty(), pipe, service, args);
                        }
                        Err(err) => {
                            warn!("pipe {} failed to load, force-closing: {}", id, err);
                            self.insert_force_closed(id, hw);
                        }
                    }
                }
                0 => self.insert_force_closed(id, hw),
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bad pipe record marker {}", other),
                    ));
                }
            }
            loaded.push(id);
        }
        Ok(loaded)
    }

    fn load_record(
        &self,
        id: PipeId,
        blob: &[u8],
    ) -> io::Result<(Box<dyn ServicePipe>, Arc<dyn Service>, Option<String>)> {
        let mut slice: &[u8] = blob;
        let mut blob_reader = SnapshotReader::new(&mut slice);
        let name = blob_reader.get_string()?;
        let raw_args = blob_reader.get_string()?;
        let args = (!raw_args.is_empty()).then_some(raw_args);
        let service = self
            .registry()
            .lookup(&name)
            .ok_or_else(|| invalid(format!("unknown service {}", name)))?;
        if !service.can_load() {
            return Err(invalid(format!("service {} cannot load", name)));
        }
        let pipe = service
            .load(self.pipe_context(id), args.as_deref(), &mut blob_reader)
            .ok_or_else(|| invalid(format!("service {} rejected pipe state", name)))?;
        Ok((pipe, service, args))
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
