//! The surface the event registry plugs into: per-event protocol
//! descriptors that discriminate the message types a channel half may emit
//! or observe, and the [`Event`] trait binding an invocation to its
//! dispatch and upstream protocols.

/// Where a message takes the channel's protocol next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The channel stays in the current protocol.
    Stay,
    /// The channel moves to a new protocol.
    To(&'static ProtocolDescriptor),
    /// The message terminates the channel.
    Terminal,
}

/// One allowed message type within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpec {
    /// Wire type code.
    pub code: u64,
    /// Name used in logs and diagnostics.
    pub name: &'static str,
    /// Whether the message is surfaced to the consumer. Control messages
    /// such as `choke` terminate the channel without being delivered.
    pub delivered: bool,
    pub transition: Transition,
}

/// A state of a channel half's protocol: the discriminated set of message
/// types allowed next.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub messages: &'static [MessageSpec],
}

impl ProtocolDescriptor {
    /// Looks up the spec for a type code, if the protocol allows it.
    pub fn message(&self, code: u64) -> Option<&MessageSpec> {
        self.messages.iter().find(|spec| spec.code == code)
    }

    /// A protocol with no messages is mute: no receiver is retained for a
    /// channel whose upstream protocol is mute.
    pub fn is_mute(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A protocol allowing nothing. The upstream protocol of fire-and-forget
/// events.
pub static MUTE: ProtocolDescriptor = ProtocolDescriptor {
    name: "mute",
    messages: &[],
};

/// A named RPC operation: its initial-message type code and the protocols
/// of its two channel halves.
pub trait Event: 'static {
    /// Type code of the initial invocation frame.
    const ID: u64;
    /// Event name used in logs.
    const NAME: &'static str;

    /// Allowed outgoing message types for the sender half.
    fn dispatch() -> &'static ProtocolDescriptor;

    /// Allowed incoming message types for the receiver half.
    fn upstream() -> &'static ProtocolDescriptor;
}

/// The stock streaming protocol: any number of `chunk` messages, ended by
/// either an `error` or a silent `choke`.
pub mod streaming {
    use super::{MessageSpec, ProtocolDescriptor, Transition};

    pub const CHUNK: u64 = 0;
    pub const ERROR: u64 = 1;
    pub const CHOKE: u64 = 2;

    pub static PROTOCOL: ProtocolDescriptor = ProtocolDescriptor {
        name: "streaming",
        messages: &[
            MessageSpec {
                code: CHUNK,
                name: "chunk",
                delivered: true,
                transition: Transition::Stay,
            },
            MessageSpec {
                code: ERROR,
                name: "error",
                delivered: true,
                transition: Transition::Terminal,
            },
            MessageSpec {
                code: CHOKE,
                name: "choke",
                delivered: false,
                transition: Transition::Terminal,
            },
        ],
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_code() {
        let chunk = streaming::PROTOCOL.message(streaming::CHUNK).unwrap();
        assert_eq!(chunk.name, "chunk");
        assert_eq!(chunk.transition, Transition::Stay);
        assert!(chunk.delivered);

        let choke = streaming::PROTOCOL.message(streaming::CHOKE).unwrap();
        assert_eq!(choke.transition, Transition::Terminal);
        assert!(!choke.delivered);

        assert!(streaming::PROTOCOL.message(99).is_none());
    }

    #[test]
    fn mute_protocols() {
        assert!(MUTE.is_mute());
        assert!(!streaming::PROTOCOL.is_mute());
    }

    #[test]
    fn recursive_transition() {
        static INNER: ProtocolDescriptor = ProtocolDescriptor {
            name: "inner",
            messages: &[MessageSpec {
                code: 0,
                name: "done",
                delivered: true,
                transition: Transition::Terminal,
            }],
        };
        static OUTER: ProtocolDescriptor = ProtocolDescriptor {
            name: "outer",
            messages: &[MessageSpec {
                code: 0,
                name: "descend",
                delivered: true,
                transition: Transition::To(&INNER),
            }],
        };

        match OUTER.message(0).unwrap().transition {
            Transition::To(next) => assert_eq!(next.name, "inner"),
            other => panic!("expected transition, got {other:?}"),
        }
    }
}
