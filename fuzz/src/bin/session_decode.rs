#[macro_use]
extern crate afl;
use pawl::SessionCodec;

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = SessionCodec::decode(data);
    });
}
