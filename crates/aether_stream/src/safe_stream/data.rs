use {
    super::SafeStreamSendingAction,
    aether_action::{Action, ActionBase, ActionContext, EventSubscriber, StateMachine},
    aether_proto::ring::{OffsetRange, RingIndex},
    alloc::{
        collections::VecDeque,
        rc::{Rc, Weak},
        vec::Vec,
    },
    bytes::{Bytes, BytesMut},
    core::{cell::Cell, fmt},
    log::{trace, warn},
    web_time::Instant,
};

/// Progress of a [`SendingDataAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendingDataState {
    /// Buffered, no byte has been sent yet.
    Waiting,
    /// At least one byte has been sent.
    Sending,
    /// Every byte was confirmed by the peer.
    Done,
    /// Stopped before being sent, or the transport stopped its packet.
    Stopped,
    /// Could not be delivered.
    Failed,
}

impl SendingDataState {
    /// Returns `true` if the data can no longer change state.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Failed)
    }
}

/// One payload handed to a [`SafeStreamSendingAction`], finishing once the
/// peer confirmed all of it.
///
/// A payload can be stopped as long as none of it has been sent. The payloads
/// buffered after it then move down to close the gap.
pub struct SendingDataAction {
    base: ActionBase<Self>,
    state: StateMachine<SendingDataState>,
    len: usize,
    sender: Weak<SafeStreamSendingAction>,
}

impl fmt::Debug for SendingDataAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendingDataAction")
            .field("state", &self.state.get())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl SendingDataAction {
    pub(super) fn new(
        context: &ActionContext,
        len: usize,
        sender: Weak<SafeStreamSendingAction>,
    ) -> Rc<Self> {
        context.spawn(|base| Self {
            base,
            state: StateMachine::new(SendingDataState::Waiting),
            len,
            sender,
        })
    }

    /// Gets the current state.
    #[must_use]
    pub fn state(&self) -> SendingDataState {
        self.state.get()
    }

    /// Event emitted with the new state on every change.
    #[must_use]
    pub fn state_event(&self) -> EventSubscriber<SendingDataState> {
        self.state.changed_event()
    }

    /// Number of bytes in the payload.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the payload is empty, which never happens for a
    /// payload accepted by a sender.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(super) fn set_state(&self, state: SendingDataState) {
        let current = self.state.get();
        if current.is_final() {
            return;
        }
        self.state.set(state);
        self.base.trigger();
    }
}

impl Action for SendingDataAction {
    fn update(&self, now: Instant) -> Instant {
        match self.state.acquire() {
            Some(SendingDataState::Done) => self.base.result(),
            Some(SendingDataState::Stopped) => self.base.stop(),
            Some(SendingDataState::Failed) => self.base.error(),
            Some(SendingDataState::Waiting | SendingDataState::Sending) | None => {}
        }
        now
    }

    fn base(&self) -> &ActionBase<Self> {
        &self.base
    }

    fn stop(&self) {
        match self.state.get() {
            SendingDataState::Sending => {
                warn!("Refusing to stop data of {} bytes which is already being sent", self.len);
            }
            SendingDataState::Waiting => {
                let removed = self
                    .sender
                    .upgrade()
                    .is_some_and(|sender| sender.remove_unsent(self));
                if !removed {
                    trace!("Stopping data which is no longer buffered");
                }
                self.set_state(SendingDataState::Stopped);
            }
            SendingDataState::Done | SendingDataState::Stopped | SendingDataState::Failed => {}
        }
    }
}

struct Entry {
    begin: RingIndex,
    data: Bytes,
    action: Rc<SendingDataAction>,
}

/// Contiguous run of buffered bytes picked for one data message.
#[derive(Debug)]
pub struct DataSlice {
    /// Offsets covered.
    pub range: OffsetRange,
    /// Bytes of the range.
    pub data: Bytes,
    /// Payloads which have at least one byte in the range.
    pub actions: Vec<Rc<SendingDataAction>>,
}

/// Unconfirmed payloads, in offset order.
///
/// Every position is measured from an origin passed in by the caller, the
/// oldest unconfirmed offset. No entry starts before the origin: confirming
/// part of an entry trims it.
#[derive(Default)]
pub struct SendDataBuffer {
    entries: VecDeque<Entry>,
}

impl fmt::Debug for SendDataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendDataBuffer")
            .field("entries", &self.entries.len())
            .field("size", &self.size())
            .finish()
    }
}

impl SendDataBuffer {
    /// Number of buffered payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.iter().map(|entry| entry.data.len()).sum()
    }

    /// Appends `data` at `begin`, which must be the end of the last entry or
    /// later.
    pub fn push(&mut self, begin: RingIndex, data: Bytes, action: Rc<SendingDataAction>) {
        self.entries.push_back(Entry {
            begin,
            data,
            action,
        });
    }

    /// Takes up to `max` contiguous bytes, starting at `from` or at the next
    /// buffered byte after it.
    ///
    /// A gap in the buffer ends the slice.
    #[must_use]
    pub fn slice(&self, origin: RingIndex, from: RingIndex, max: usize) -> Option<DataSlice> {
        let rel = |offset: RingIndex| usize::from(origin.distance(offset));
        let start = rel(from);
        let first = self
            .entries
            .iter()
            .position(|entry| rel(entry.begin) + entry.data.len() > start)?;
        let begin = start.max(rel(self.entries[first].begin));

        let mut cursor = begin;
        let mut parts = Vec::new();
        let mut actions = Vec::new();
        for entry in self.entries.range(first..) {
            let entry_begin = rel(entry.begin);
            let taken = cursor - begin;
            if entry_begin > cursor || taken >= max {
                break;
            }
            let skip = cursor - entry_begin;
            let take = (entry.data.len() - skip).min(max - taken);
            parts.push(entry.data.slice(skip..skip + take));
            actions.push(entry.action.clone());
            cursor += take;
        }
        if cursor == begin {
            return None;
        }

        let data = if parts.len() == 1 {
            parts.swap_remove(0)
        } else {
            let mut joined = BytesMut::with_capacity(cursor - begin);
            for part in parts {
                joined.extend_from_slice(&part);
            }
            joined.freeze()
        };
        Some(DataSlice {
            range: OffsetRange::from_len(origin.advance(begin), cursor - begin),
            data,
            actions,
        })
    }

    /// Drops every byte before `end`, returning the payloads which are now
    /// fully confirmed.
    pub fn confirm(&mut self, origin: RingIndex, end: RingIndex) -> Vec<Rc<SendingDataAction>> {
        let rel = |offset: RingIndex| usize::from(origin.distance(offset));
        let confirmed = rel(end);
        let mut done = Vec::new();
        while let Some(front) = self.entries.front_mut() {
            let front_begin = rel(front.begin);
            if front_begin + front.data.len() <= confirmed {
                if let Some(entry) = self.entries.pop_front() {
                    done.push(entry.action);
                }
                continue;
            }
            if front_begin < confirmed {
                let skip = confirmed - front_begin;
                front.data = front.data.slice(skip..);
                front.begin = end;
            }
            break;
        }
        done
    }

    /// Drops every payload with a byte in `range`, returning them along with
    /// the offsets they were buffered at.
    pub fn remove_range(
        &mut self,
        origin: RingIndex,
        range: OffsetRange,
    ) -> Vec<(OffsetRange, Rc<SendingDataAction>)> {
        let rel = |offset: RingIndex| usize::from(origin.distance(offset));
        let (range_begin, range_end) = (rel(range.begin), rel(range.end));
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let entry_begin = rel(entry.begin);
            let overlaps =
                entry_begin < range_end && range_begin < entry_begin + entry.data.len();
            if overlaps {
                removed.push((
                    OffsetRange::from_len(entry.begin, entry.data.len()),
                    entry.action.clone(),
                ));
            }
            !overlaps
        });
        removed
    }

    /// Drops the payload of `action` and moves every later payload down by its
    /// length, returning that length.
    pub fn remove_compact(&mut self, action: &SendingDataAction) -> Option<usize> {
        let pos = self
            .entries
            .iter()
            .position(|entry| core::ptr::eq(&*entry.action, action))?;
        let entry = self.entries.remove(pos)?;
        let len = entry.data.len();
        let shift = u16::try_from(len).expect("buffered payload should fit in the ring");
        for later in self.entries.range_mut(pos..) {
            later.begin = later.begin.counter_clockwise(shift);
        }
        Some(len)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, aether_action::ActionProcessor};

    fn buffer(
        processor: &ActionProcessor,
        origin: RingIndex,
        payloads: &[&'static [u8]],
    ) -> (SendDataBuffer, Vec<Rc<SendingDataAction>>) {
        let mut buffer = SendDataBuffer::default();
        let mut actions = Vec::new();
        let mut at = origin;
        for payload in payloads {
            let action = SendingDataAction::new(processor.context(), payload.len(), Weak::new());
            buffer.push(at, Bytes::from_static(payload), action.clone());
            at = at.advance(payload.len());
            actions.push(action);
        }
        (buffer, actions)
    }

    #[test]
    fn slices_join_payloads() {
        let processor = ActionProcessor::new();
        let origin = RingIndex(u16::MAX - 2);
        let (buffer, actions) = buffer(&processor, origin, &[b"abc", b"defg", b"h"]);

        let slice = buffer.slice(origin, origin.advance(1), 5).expect("data buffered");
        assert_eq!(&b"bcdef"[..], &slice.data[..]);
        assert_eq!(OffsetRange::from_len(origin.advance(1), 5), slice.range);
        assert_eq!(2, slice.actions.len());
        assert!(Rc::ptr_eq(&actions[0], &slice.actions[0]));

        assert!(buffer.slice(origin, origin.advance(8), 5).is_none());
    }

    #[test]
    fn slices_stop_at_holes() {
        let processor = ActionProcessor::new();
        let origin = RingIndex(0);
        let (mut buffer, _) = buffer(&processor, origin, &[b"ab", b"cd", b"ef"]);
        buffer.remove_range(origin, OffsetRange::from_len(RingIndex(2), 1));

        let slice = buffer.slice(origin, origin, 10).expect("data buffered");
        assert_eq!(&b"ab"[..], &slice.data[..]);
        let slice = buffer.slice(origin, RingIndex(2), 10).expect("data buffered");
        assert_eq!(&b"ef"[..], &slice.data[..]);
        assert_eq!(RingIndex(4), slice.range.begin);
    }

    #[test]
    fn confirm_trims_partial_payload() {
        let processor = ActionProcessor::new();
        let origin = RingIndex(10);
        let (mut buffer, actions) = buffer(&processor, origin, &[b"abc", b"def"]);

        let done = buffer.confirm(origin, RingIndex(14));
        assert_eq!(1, done.len());
        assert!(Rc::ptr_eq(&actions[0], &done[0]));
        assert_eq!(2, buffer.size());

        let origin = RingIndex(14);
        let slice = buffer.slice(origin, origin, 10).expect("data buffered");
        assert_eq!(&b"ef"[..], &slice.data[..]);
    }

    #[test]
    fn compaction_closes_gap() {
        let processor = ActionProcessor::new();
        let origin = RingIndex(0);
        let (mut buffer, actions) = buffer(&processor, origin, &[b"ab", b"cd", b"ef"]);

        assert_eq!(Some(2), buffer.remove_compact(&actions[1]));
        let slice = buffer.slice(origin, origin, 10).expect("data buffered");
        assert_eq!(&b"abef"[..], &slice.data[..]);
        assert_eq!(None, buffer.remove_compact(&actions[1]));
    }
}
