use decoder::cfg::ThbcConf;
use decoder::testing::ScriptedPort;
use chrono::NaiveDate;
use decoder::thbc::{
    check_passing, ipconfig_frame, mcrf4xx, set_date_cmd, thbc_sum, Check, DecoderConfig, Thbc,
    ThbcCommands, ACKCMD, QUECMD,
};
use decoder::{Context, Decoder, DecoderHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use todtools::{TimeValue, Tod};

const PAYLOAD: &[u8] = b"BOX 012345 12:34:56.789 0042 0 1";

fn frame(payload: &[u8], sum: &[u8]) -> Vec<u8> {
    [&b"<"[..], payload, sum, &b">\r\n"[..]].concat()
}

fn acks(out: &[u8]) -> usize {
    out.windows(ACKCMD.len()).filter(|w| *w == ACKCMD).count()
}

fn site_conf() -> ThbcConf {
    ThbcConf {
        ipaddr: String::from("192.168.95.252"),
        netmask: String::from("255.255.255.0"),
        gateway: String::from("192.168.95.1"),
        host: String::from("192.168.95.20"),
        ..ThbcConf::default()
    }
}

fn attached(cfg: ThbcConf) -> (Thbc, Context, ScriptedPort, Arc<Mutex<Vec<Tod>>>) {
    let wire = ScriptedPort::new();
    let ctx = Context::new("thbc");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    ctx.set_callback(Some(Box::new(move |t| s.lock().push(t))));
    let mut thbc = Thbc::new(cfg);
    thbc.attach(&ctx, wire.boxed()).unwrap();
    (thbc, ctx, wire, seen)
}

/// Configuration dump as sent in reply to a query
fn dump(cfg: &ThbcConf) -> Vec<u8> {
    let mut msg = b"+++".to_vec();
    msg.extend_from_slice(&DecoderConfig::from(cfg).serialise());
    msg.extend_from_slice(&[192, 168, 95, 252, 255, 255, 255, 0]);
    msg.extend_from_slice(&[192, 168, 95, 1, 192, 168, 95, 20]);
    msg.extend_from_slice(&[1, 2, 3, 4, 0x21, 0, 0, 0]);
    msg.extend_from_slice(b"\r\n");
    msg
}

#[test]
fn decimal_sum_detects_any_changed_byte() {
    assert_eq!(*b"1630", thbc_sum(PAYLOAD));
    let msg = frame(PAYLOAD, b"1630");
    assert_eq!(Check::Valid, check_passing(&msg));
    for i in 1..33 {
        let mut bad = msg.clone();
        bad[i] = if bad[i] == b'9' { b'8' } else { bad[i] + 1 };
        assert!(
            matches!(check_passing(&bad), Check::Invalid(..)),
            "byte {} changed",
            i
        );
    }
    assert_eq!(Check::Malformed, check_passing(b"<BOX 0123>"));
    assert_eq!(Check::Malformed, check_passing(&msg[1..]));
}

#[test]
fn ip_config_frame() {
    let mut want = vec![0x1b, 0x09, 0x09];
    want.extend_from_slice(&[192, 168, 95, 252, 255, 255, 255, 0]);
    want.extend_from_slice(&[192, 168, 95, 1, 192, 168, 95, 20]);
    want.extend_from_slice(&[0x00, 0xbb, b'>']);
    assert_eq!(want, ipconfig_frame(&site_conf()));

    let cfg = ThbcConf {
        host: String::new(),
        ..site_conf()
    };
    let frame = ipconfig_frame(&cfg);
    assert_eq!(&[0u8; 4][..], &frame[15..19]);
}

#[test]
fn valid_passing_is_acknowledged() {
    let (mut thbc, ctx, wire, seen) = attached(ThbcConf::default());
    assert_eq!(QUECMD, &wire.take_written()[..]);
    assert_eq!(1, ctx.queue().len());

    wire.feed(frame(PAYLOAD, b"1630"));
    thbc.read(&ctx).unwrap();
    assert_eq!(ACKCMD, &wire.take_written()[..]);
    let seen = seen.lock();
    assert_eq!(1, seen.len());
    assert_eq!("12345", seen[0].refid);
    assert_eq!("C1", seen[0].chan);
    assert_eq!("0042:1", seen[0].index);
    assert_eq!("12h34:56.789", seen[0].rawtime(3));
}

#[test]
fn repeated_checksum_failures_are_acknowledged() {
    let (mut thbc, ctx, wire, seen) = attached(ThbcConf::default());
    wire.take_written();
    for _ in 0..3 {
        wire.feed(frame(PAYLOAD, b"0000"));
    }
    thbc.read(&ctx).unwrap();
    assert_eq!(0, acks(&wire.written()));

    wire.feed(frame(PAYLOAD, b"0000"));
    thbc.read(&ctx).unwrap();
    assert_eq!(1, acks(&wire.written()));
    assert!(seen.lock().is_empty());

    // a good passing resets the count
    wire.feed(frame(PAYLOAD, b"1630"));
    wire.feed(frame(PAYLOAD, b"0000"));
    thbc.read(&ctx).unwrap();
    assert_eq!(2, acks(&wire.written()));
    assert_eq!(1, seen.lock().len());
}

#[test]
fn config_dump_identifies_the_decoder() {
    let (mut thbc, ctx, wire, _) = attached(ThbcConf::default());
    assert!(!thbc.connected());
    wire.feed(dump(&ThbcConf::default()));
    thbc.read(&ctx).unwrap();
    assert!(thbc.connected());
    assert_eq!(Some("1234"), thbc.boxname());

    // matching config is left alone
    wire.take_written();
    thbc.sane(&ctx).unwrap();
    assert!(wire.written().is_empty());
}

#[test]
fn sane_rewrites_a_different_config() {
    let cfg = ThbcConf {
        detectmax: true,
        levels: Some(12),
        ..ThbcConf::default()
    };
    let (mut thbc, ctx, wire, _) = attached(cfg.clone());
    wire.feed(dump(&ThbcConf::default()));
    thbc.read(&ctx).unwrap();
    wire.take_written();

    thbc.sane(&ctx).unwrap();
    let out = wire.written();
    assert_eq!(&[0x1bu8, 0x08, 0x08][..], &out[..3]);
    assert_eq!(&DecoderConfig::from(&cfg).serialise()[..], &out[3..30]);
    assert_eq!(b'>', out[32]);
    assert_eq!(QUECMD, &out[33..35]);
    assert_eq!(b"\x1b\x1f12\x1b\x1e12", &out[35..]);

    // the new config is remembered
    wire.take_written();
    thbc.sane(&ctx).unwrap();
    assert_eq!(b"\x1b\x1f12\x1b\x1e12", &wire.written()[..]);
}

#[test]
fn date_frame() {
    let date = NaiveDate::from_ymd_opt(2024, 7, 21).unwrap();
    let body = [0x0au8, 0x0a, 21, 7, 24];
    let crc = mcrf4xx(&body).to_be_bytes();
    let mut want = vec![0x1bu8];
    want.extend_from_slice(&body);
    want.extend_from_slice(&crc);
    want.push(b'>');
    assert_eq!(want, set_date_cmd(&date));
}

#[test]
fn sync_sets_date_then_time() {
    let (mut thbc, ctx, wire, _) = attached(ThbcConf::default());
    thbc.sync(&ctx).unwrap();
    let out = wire.written();
    assert_eq!(15, out.len());
    assert_eq!(&[0x1bu8, 0x0a, 0x0a][..], &out[..3]);
    assert_eq!(b'>', out[8]);
    assert_eq!(&[0x1bu8, 0x48][..], &out[9..11]);
    assert_eq!(0x74, out[14]);
}

#[test]
fn handle_sends_raw_requests() {
    let wire = ScriptedPort::new();
    let h = DecoderHandle::start(Thbc::new(ThbcConf::default())).unwrap();
    h.attach(wire.boxed());
    h.wait();
    wire.take_written();
    h.get_config();
    h.ipconfig(&site_conf());
    h.wait();
    let mut want = QUECMD.to_vec();
    want.extend_from_slice(&ipconfig_frame(&site_conf()));
    assert_eq!(want, wire.written());
    h.exit(None);
    h.join();
    assert!(wire.closed());
}
