#![no_main]
use libfuzzer_sys::fuzz_target;
use pullwire::torrent::bencode::{info_span, BencodeValue};

fuzz_target!(|data: &[u8]| {
    // parse() should never panic on arbitrary input
    let _ = BencodeValue::parse_prefix(data);
    let _ = BencodeValue::parse_exact(data);
    let _ = info_span(data);
});
