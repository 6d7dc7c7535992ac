#[macro_use]
extern crate afl;
use pawl::MessageEnvelope;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = MessageEnvelope::from_bytes(data) {
            assert_eq!(envelope.to_bytes(), data);
        }
    });
}
