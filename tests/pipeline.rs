//! End-to-end run: compiled signature files against a captured
//! dialogue, matched sessions written as JSON lines.

use std::fs;
use std::net::IpAddr;

use smtpscout::config::TcpConfig;
use smtpscout::core::packet::{TcpFlags, TcpPacket};
use smtpscout::engine::{JsonlSink, MemorySource, NullObserver, PacketSource, Pipeline};
use smtpscout::signatures::{SignatureCompiler, SignatureMatcher};

const CLIENT: &str = "192.168.1.10";
const SERVER: &str = "10.0.0.25";

struct Capture {
    packets: Vec<TcpPacket>,
    client_seq: u64,
    server_seq: u64,
}

impl Capture {
    fn new() -> Self {
        let mut c = Self {
            packets: Vec::new(),
            client_seq: 1000,
            server_seq: 2000,
        };
        c.push(true, 1000, 0, TcpFlags { syn: true, ..Default::default() }, b"");
        c.push(false, 2000, 1001, TcpFlags { syn: true, ack: true, ..Default::default() }, b"");
        c.push(true, 1001, 2001, TcpFlags { ack: true, ..Default::default() }, b"");
        c.client_seq = 1001;
        c.server_seq = 2001;
        c
    }

    fn push(&mut self, from_client: bool, seq: u64, ack: u64, flags: TcpFlags, payload: &[u8]) {
        let (src, dst) = if from_client {
            ((CLIENT, 45000), (SERVER, 25))
        } else {
            ((SERVER, 25), (CLIENT, 45000))
        };
        self.packets.push(TcpPacket {
            ts_sec: 100,
            ts_usec: 0,
            src_ip: src.0.parse().unwrap(),
            src_port: src.1,
            dst_ip: dst.0.parse().unwrap(),
            dst_port: dst.1,
            seq,
            ack,
            window: 65535,
            flags,
            options: vec![],
            payload: payload.to_vec(),
        });
    }

    fn client(&mut self, payload: &str) {
        let (seq, ack) = (self.client_seq, self.server_seq);
        self.push(true, seq, ack, TcpFlags { ack: true, ..Default::default() }, payload.as_bytes());
        self.client_seq += payload.len() as u64;
    }

    fn server(&mut self, payload: &str) {
        let (seq, ack) = (self.server_seq, self.client_seq);
        self.push(false, seq, ack, TcpFlags { ack: true, ..Default::default() }, payload.as_bytes());
        self.server_seq += payload.len() as u64;
    }

    fn close(&mut self) {
        let (cs, ss) = (self.client_seq, self.server_seq);
        self.push(true, cs, ss, TcpFlags { fin: true, ack: true, ..Default::default() }, b"");
        self.push(false, ss, cs + 1, TcpFlags { fin: true, ack: true, ..Default::default() }, b"");
        self.push(true, cs + 1, ss + 1, TcpFlags { ack: true, ..Default::default() }, b"");
    }
}

fn bot_dialogue() -> Vec<TcpPacket> {
    let mut c = Capture::new();
    c.server("220 mx.example.net ESMTP\r\n");
    c.client("HELO spam-host.example.org\r\n");
    c.server("250 mx.example.net\r\n");
    c.client("MAIL FROM:<bot@example.org>\r\n");
    c.server("250 OK\r\n");
    c.client("RCPT TO:<victim@example.net>\r\n");
    c.server("250 OK\r\n");
    c.client("QUIT\r\n");
    c.server("221 Bye\r\n");
    c.close();
    c.packets
}

const MACROS: &str = "$crlf = \"\\r\\n\"\n";

const SIGNATURES: &str = "var $helo = \"[A-Za-z0-9.-]+\"\n\
sig \"mailer-probe\" {\n\
  tcp : \"close\";\n\
  smtp : \"HELO $helo$$crlf$\";\n\
  smtp : \"MAIL FROM:<.*>$crlf$\";\n\
  smtp : \"QUIT$crlf$\";\n\
}\n";

#[tokio::test]
async fn matched_session_reaches_results_file() {
    let dir = tempfile::tempdir().unwrap();
    let macro_path = dir.path().join("macros.def");
    let sig_path = dir.path().join("bots.sig");
    let results_path = dir.path().join("results.jsonl");
    fs::write(&macro_path, MACROS).unwrap();
    fs::write(&sig_path, SIGNATURES).unwrap();

    let mut compiler = SignatureCompiler::new();
    compiler.load_macro_file(&macro_path).unwrap();
    let signatures = compiler.compile_file(&sig_path).unwrap();
    assert_eq!(signatures.len(), 1);

    let pipeline = Pipeline::new(
        TcpConfig::default(),
        true,
        64,
        SignatureMatcher::from_signatures(signatures),
    );
    let sources: Vec<Box<dyn PacketSource>> =
        vec![Box::new(MemorySource::new(bot_dialogue()))];
    let mut sink = JsonlSink::create(&results_path).unwrap();

    let report = pipeline
        .run(sources, &mut sink, &mut NullObserver)
        .await
        .unwrap();
    drop(sink);

    assert_eq!(report.tcp_sessions, 1);
    assert_eq!(report.smtp_sessions, 1);
    assert_eq!(report.matched_sessions, 1);

    let contents = fs::read_to_string(&results_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);

    let matched: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(matched["signatures"][0], "mailer-probe");
    let client: IpAddr = matched["session"]["client"][0]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(client, CLIENT.parse::<IpAddr>().unwrap());
}

#[tokio::test]
async fn open_session_fails_close_precondition() {
    let mut c = Capture::new();
    c.server("220 mx.example.net ESMTP\r\n");
    c.client("HELO spam-host.example.org\r\n");
    c.server("250 mx.example.net\r\n");
    c.client("MAIL FROM:<bot@example.org>\r\n");
    c.server("250 OK\r\n");
    c.client("QUIT\r\n");
    // no FIN exchange, the session is flushed still open

    let dir = tempfile::tempdir().unwrap();
    let sig_path = dir.path().join("bots.sig");
    let results_path = dir.path().join("results.jsonl");
    fs::write(
        &sig_path,
        "sig \"closer\" {\n  tcp : \"close\";\n  smtp : \"QUIT\\r\\n\";\n}\n",
    )
    .unwrap();

    let signatures = SignatureCompiler::new().compile_file(&sig_path).unwrap();
    let pipeline = Pipeline::new(
        TcpConfig::default(),
        true,
        64,
        SignatureMatcher::from_signatures(signatures),
    );
    let sources: Vec<Box<dyn PacketSource>> =
        vec![Box::new(MemorySource::new(c.packets))];
    let mut sink = JsonlSink::create(&results_path).unwrap();

    let report = pipeline
        .run(sources, &mut sink, &mut NullObserver)
        .await
        .unwrap();

    assert_eq!(report.smtp_sessions, 1);
    assert_eq!(report.matched_sessions, 0);
    assert!(fs::read_to_string(&results_path).unwrap().is_empty());
}
