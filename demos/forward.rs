//! Replays an RTP capture named on the command line to a live receiver
//! over TCP, preserving the record framing so the receiver can parse the
//! stream exactly as this crate would.  An optional third argument limits
//! how many records are sent.

use mpegps_reader::rtp;
use mpegps_reader::sink;
use std::env;
use std::fs::File;
use std::io::Read;
use std::net::TcpStream;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let name = env::args().nth(1).expect("usage: forward <capture> <host:port> [count]");
    let addr = env::args().nth(2).expect("usage: forward <capture> <host:port> [count]");
    let limit = match env::args().nth(3) {
        Some(n) => n.parse().expect("count must be a number"),
        None => u64::MAX,
    };
    let mut f = File::open(&name).unwrap_or_else(|_| panic!("file not found: {}", &name));
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).expect("read failed");

    let stream = TcpStream::connect(&addr)
        .unwrap_or_else(|e| panic!("connecting to {} failed: {}", addr, e));
    let mut forwarder = sink::Forwarder::new(stream, limit);
    let mut session = rtp::RtpDecoder::new(&buf[..]);
    match session.run(&mut forwarder) {
        Ok(end) => println!("session ended: {:?}", end),
        Err(e) => println!("capture unusable: {:?}", e),
    }
    println!("{}", session.state());
}
