#![no_main]

use libfuzzer_sys::fuzz_target;

use ribflow_bgp::attr::{is_private_as, AsPath};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as a sequence of u32 AS numbers plus a few
    // policy knobs taken from the first bytes.
    if data.len() < 3 {
        return;
    }
    let all = data[0] & 1 != 0;
    let replace = data[0] & 2 != 0;
    let local_as = u32::from(data[1]).max(1);
    let avoid = if data[2] & 1 != 0 {
        Some(u32::from(data[2]))
    } else {
        None
    };

    let hops: Vec<u32> = data[3..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .take(256)
        .collect();
    let path = AsPath::from_sequence(hops.iter().copied());

    let scrubbed = path.remove_private(all, replace, local_as, avoid);

    // Never grows, and with replace+all never shrinks either.
    assert!(scrubbed.len() <= path.len());
    if replace && all {
        assert_eq!(scrubbed.len(), path.len());
    }
    // With `all`, no private AS survives except as a replacement value.
    if all && !replace {
        assert!(!scrubbed.as_slice().iter().any(|asn| is_private_as(*asn)));
    }
    // Idempotence: scrubbing a scrubbed path changes nothing when the
    // replacement values themselves are public.
    if all && !scrubbed.as_slice().iter().any(|asn| is_private_as(*asn)) {
        let again = scrubbed.remove_private(all, replace, local_as, avoid);
        assert_eq!(again, scrubbed);
    }

    // Override then loop-check must agree.
    let mut overridden = path.clone();
    overridden.replace_as(local_as.wrapping_add(1), local_as);
    assert!(!overridden.contains(local_as.wrapping_add(1)) || local_as == u32::MAX);
});
