#![no_main]

use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pgbackup_connect::auth::ScramSha256;

#[derive(Debug)]
struct ScramInput {
    password: String,
    server_first: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for ScramInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            password: u.arbitrary()?,
            server_first: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ScramInput| {
    let client = ScramSha256::new(input.password);
    let _first = client.client_first();

    // Large iteration counts are legal but would stall the fuzzer
    let too_slow = input
        .server_first
        .split(',')
        .filter_map(|attr| attr.strip_prefix("i="))
        .any(|i| i.parse::<u32>().map_or(false, |n| n > 4096));
    if too_slow {
        return;
    }
    if let Ok((_, verifier)) = client.handle_server_first(&input.server_first) {
        let _ = verifier.verify(&input.server_final);
    }
});
