//! Dumps the record-level structure of an RTP capture named on the command
//! line: one CSV row per accepted record on stdout, with the stream
//! identity summarised on stderr at the end.
//!
//! With a second argument of hex digits, instead searches the capture for
//! that byte pattern and reports where it first occurs.

use mpegps_reader::rtp;
use mpegps_reader::sink;
use std::env;
use std::fs::File;
use std::io::Read;

fn parse_hex(s: &str) -> Vec<u8> {
    let digits: Vec<u8> = s
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).expect("pattern must be hex digits") as u8)
        .collect();
    assert!(digits.len() % 2 == 0, "pattern must be whole bytes");
    digits.chunks(2).map(|d| d[0] << 4 | d[1]).collect()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let name = env::args().nth(1).expect("usage: rtpdump <capture> [hex-pattern]");
    let mut f = File::open(&name).unwrap_or_else(|_| panic!("file not found: {}", &name));
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).expect("read failed");

    let mut session = rtp::RtpDecoder::new(&buf[..]);
    if let Some(pattern) = env::args().nth(2) {
        match session.scan_for(&parse_hex(&pattern)) {
            Ok(Some(hit)) => println!(
                "found at offset {:#x}, in record with sequence number {}{}",
                hit.position,
                hit.sequence_number,
                match hit.kind {
                    Some(kind) => format!(" ({:?} PES)", kind),
                    None => String::new(),
                }
            ),
            Ok(None) => println!("pattern not found"),
            Err(e) => println!("capture unusable: {:?}", e),
        }
        return;
    }

    let stdout = std::io::stdout();
    let mut log = sink::CsvPacketLog::new(stdout.lock()).expect("writing the CSV header failed");
    match session.run(&mut log) {
        Ok(end) => eprintln!("session ended: {:?}", end),
        Err(e) => eprintln!("capture unusable: {:?}", e),
    }
    eprintln!("{}", session.state());
}
