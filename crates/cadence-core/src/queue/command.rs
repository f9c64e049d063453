//! Lock-free command queue from the control thread to the render thread
//!
//! Commands are small `Copy` values pushed through an `rtrb` SPSC ring and
//! applied by the renderer at the start of its next block, so no command ever
//! takes effect in the middle of a block.
//!
//! Unlike telemetry, commands are never dropped silently: a full queue is
//! reported to the sender as [`EngineError::QueueFull`] and the caller decides
//! whether to retry.

use crate::error::{EngineError, EngineResult};

/// Commands sent from the control thread to the render thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    /// Drop transient render state: ramps, load level, dropout history
    Reset,
    /// Adopt a new stream format
    Prepare {
        sample_rate: u32,
        block_size: usize,
        channel_count: usize,
    },
    /// Force the load level (0 = full quality)
    SetLoadLevel(u8),
}

/// Control-side end of the command queue
pub struct CommandSender {
    producer: rtrb::Producer<EngineCommand>,
}

impl CommandSender {
    /// Queue a command, failing with `QueueFull` when there is no free slot
    pub fn send(&mut self, command: EngineCommand) -> EngineResult<()> {
        self.producer
            .push(command)
            .map_err(|_| EngineError::QueueFull)
    }

    /// Free slots left in the queue
    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Create a command channel holding at most `capacity` pending commands
///
/// Returns the control-side sender and the consumer the renderer owns.
pub fn command_channel(capacity: usize) -> (CommandSender, rtrb::Consumer<EngineCommand>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (CommandSender { producer }, consumer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_delivers_in_order() {
        let (mut tx, mut rx) = command_channel(8);
        tx.send(EngineCommand::Reset).unwrap();
        tx.send(EngineCommand::SetLoadLevel(2)).unwrap();

        assert_eq!(rx.pop().unwrap(), EngineCommand::Reset);
        assert_eq!(rx.pop().unwrap(), EngineCommand::SetLoadLevel(2));
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_full_queue_reports_backpressure() {
        let (mut tx, _rx) = command_channel(2);
        tx.send(EngineCommand::Reset).unwrap();
        tx.send(EngineCommand::Reset).unwrap();
        assert_eq!(tx.free_slots(), 0);
        assert!(matches!(
            tx.send(EngineCommand::Reset),
            Err(EngineError::QueueFull)
        ));
    }

    #[test]
    fn test_command_size() {
        // Commands are copied through the ring; keep them within a cache line
        let size = std::mem::size_of::<EngineCommand>();
        assert!(size <= 32, "EngineCommand is {} bytes, expected <= 32", size);
    }
}
