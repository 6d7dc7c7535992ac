#[macro_use]
extern crate afl;
use pawl::{MessageEnvelope, RatchetConfig, RatchetEngine, RatchetState};

fn get_state(engine: &RatchetEngine) -> RatchetState {
    let mut alice = engine
        .initialize_initiator(&[7u8; 32], None)
        .expect("Setup failed");

    // The Victim, with a receiving chain already established
    let mut bob = engine
        .initialize_responder(&[7u8; 32], None)
        .expect("Setup failed");

    let envelope = engine.encrypt(&mut alice, b"hello").expect("Setup failed");
    engine.decrypt(&mut bob, &envelope).expect("Setup failed");
    bob
}

fn main() {
    let engine = RatchetEngine::new(RatchetConfig::default());
    let mut state = get_state(&engine);

    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = MessageEnvelope::from_bytes(data) {
            let _ = engine.decrypt(&mut state, &envelope);
        }
    });
}
