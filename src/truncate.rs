//! Stable truncation of responses to a UDP size budget.

use hickory_proto::op::Message;

use crate::message::encode;

/// Shrink `msg` until its wire form fits `max_size` bytes: authority and
/// additional go first, then answers from the tail. The question is always
/// preserved and TC is set whenever anything was dropped. Returns whether
/// the message changed.
///
/// Applying this to an already-compliant message is a no-op.
pub fn truncate(msg: &mut Message, max_size: usize) -> bool {
    let encoded_len = match encode(msg) {
        Ok(bytes) => bytes.len(),
        Err(_) => return false,
    };
    if encoded_len <= max_size {
        return false;
    }

    msg.take_name_servers();
    msg.take_additionals();
    msg.set_truncated(true);

    let mut answers = msg.take_answers();
    loop {
        let mut candidate = msg.clone();
        candidate.add_answers(answers.clone());
        match encode(&candidate) {
            Ok(bytes) if bytes.len() <= max_size => break,
            _ if answers.is_empty() => break,
            _ => {
                answers.pop();
            }
        }
    }
    msg.add_answers(answers);
    true
}
