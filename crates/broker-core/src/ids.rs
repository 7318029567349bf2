//! Integer handles used to break the connection/message/queue/consumer reference cycle.
//! Every cross-reference in the broker is one of these rather than a pointer, so cleanup
//! on disconnect is just "stop looking this handle up" instead of untangling a graph.

pub type ConnectionId = usize;
/// 16-bit on the wire (ID/QUEUEID opcodes carry a short int); kept native-sized here so
/// arena arithmetic doesn't need casts, the codec narrows when framing.
pub type MessageId = u16;
pub type QueueId = u16;
