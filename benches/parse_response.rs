use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pelt::parser::{ResponseParser, ResponseSink};

struct NullSink;

impl ResponseSink for NullSink {
    fn on_header_field(&mut self, _name: &[u8]) {}
    fn on_header_value(&mut self, _value: &[u8]) {}
    fn on_body(&mut self, _chunk: &[u8]) {}
    fn on_message_complete(&mut self, _status: u16, _keep_alive: bool) {}
}

const RESPONSES: [(&str, &[u8]); 3] = [
    ("no_body", b"HTTP/1.1 204 No Content\r\nServer: stub\r\n\r\n"),
    (
        "fixed_body",
        b"HTTP/1.1 200 OK\r\nServer: stub\r\nContent-Length: 13\r\n\r\nhello, world!",
    ),
    (
        "chunked_body",
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n8\r\n, world!\r\n0\r\n\r\n",
    ),
];

fn benchmark(c: &mut Criterion) {
    for (name, raw) in RESPONSES {
        c.bench_with_input(BenchmarkId::new("response", name), black_box(&raw), |b, raw| {
            b.iter(|| {
                let mut parser = ResponseParser::new();
                parser.execute(raw, &mut NullSink)
            })
        });
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
