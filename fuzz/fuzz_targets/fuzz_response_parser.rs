#![no_main]

use libfuzzer_sys::fuzz_target;
use pelt::parser::{ResponseParser, ResponseSink};

struct NullSink;

impl ResponseSink for NullSink {
    fn on_header_field(&mut self, _name: &[u8]) {}
    fn on_header_value(&mut self, _value: &[u8]) {}
    fn on_body(&mut self, _chunk: &[u8]) {}
    fn on_message_complete(&mut self, _status: u16, _keep_alive: bool) {}
}

fuzz_target!(|data: &[u8]| {
    let mut parser = ResponseParser::new();
    let mut consumed = 0;
    while consumed < data.len() {
        match parser.execute(&data[consumed..], &mut NullSink) {
            Ok(0) => break,
            Ok(n) => {
                consumed += n;
                if parser.is_complete() {
                    parser.reset();
                }
            }
            Err(_) => break,
        }
    }
});
