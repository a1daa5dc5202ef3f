use decoder::cfg::RruConf;
use decoder::rru::{desired_config, select_channel, tick_to_tod, Rru};
use decoder::testing::ScriptedPort;
use decoder::{Context, Decoder};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use todtools::{TimeValue, Tod};

fn attached(cfg: RruConf) -> (Rru, Context, ScriptedPort, Arc<Mutex<Vec<Tod>>>) {
    let wire = ScriptedPort::new();
    let ctx = Context::new("rru");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    ctx.set_callback(Some(Box::new(move |t| s.lock().push(t))));
    let mut rru = Rru::new(cfg);
    rru.attach(&ctx, wire.boxed()).unwrap();
    (rru, ctx, wire, seen)
}

#[test]
fn ticks_convert_through_the_reference() {
    let noon: Tod = "12:00:00".parse().unwrap();
    assert_eq!(
        "12h00:10.0000",
        tick_to_tod(2560, 0, &noon).unwrap().rawtime(4)
    );
    // 1/256 s is 3906.25us, truncated
    assert_eq!(
        "12h00:00.0039",
        tick_to_tod(0x101, 0x100, &noon).unwrap().rawtime(4)
    );
    // before the reference and over midnight
    assert_eq!(
        "11h59:59.0000",
        tick_to_tod(1000, 1256, &noon).unwrap().rawtime(4)
    );
    let late: Tod = "23:59:59".parse().unwrap();
    assert_eq!("1.0000", tick_to_tod(512, 0, &late).unwrap().rawtime(4));
}

#[test]
fn quietest_channel_wins() {
    let mut noise: BTreeMap<u8, u32> = (1..=8).map(|c| (c, 100)).collect();
    assert_eq!(None, select_channel(&noise));
    noise.insert(3, 60);
    assert_eq!(None, select_channel(&noise));
    noise.insert(5, 40);
    noise.insert(2, 20);
    assert_eq!(Some((2, 20)), select_channel(&noise));

    let tied: BTreeMap<u8, u32> = [(1, 10), (2, 10), (3, 50)].into_iter().collect();
    for _ in 0..20 {
        let (ch, nv) = select_channel(&tied).unwrap();
        assert!(ch == 1 || ch == 2);
        assert_eq!(10, nv);
    }
}

#[test]
fn configured_options_override_defaults() {
    let mut cfg = RruConf::default();
    let want = desired_config(&cfg);
    assert_eq!(Some(&String::from("06")), want.get("05"));
    assert_eq!(Some(&String::from("01")), want.get("0b"));
    assert_eq!(None, want.get("06"));

    cfg.decoderconfig
        .insert(String::from("Operation Mode"), String::from("07"));
    cfg.decoderconfig
        .insert(String::from("Channel ID"), String::from("03"));
    let want = desired_config(&cfg);
    assert_eq!(Some(&String::from("07")), want.get("05"));
    assert_eq!(Some(&String::from("03")), want.get("06"));
}

#[test]
fn sane_sets_options_in_order() {
    let (_rru, _ctx, wire, _) = attached(RruConf::default());
    assert_eq!(
        "ASCII\nINFOGET;01\nCONFSET;05;06\nCONFSET;04;00\nCONFSET;0b;01\n\
         EPOCHREFGET\nTIMESTAMPGET\nCONFGET;07\nPASSINGINFOGET\n",
        wire.written_str()
    );
}

#[test]
fn passings_are_polled_after_the_reference_arrives() {
    let (mut rru, ctx, wire, seen) = attached(RruConf::default());
    wire.take_written();

    // no reference yet, nothing is requested
    rru.read(&ctx).unwrap();
    assert_eq!("", wire.written_str());

    wire.feed("INFOGET;00\n01;0000007b\n\n");
    wire.feed("EPOCHREFGET;00\n0000a8c0;00000000\n\n");
    rru.read(&ctx).unwrap();
    rru.read(&ctx).unwrap();
    assert!(rru.connected());
    rru.read(&ctx).unwrap();
    assert_eq!(b"PASSINGGET;00000000\n".to_vec(), wire.take_written());

    wire.feed("PASSINGGET;00\n00000000;00000002\n");
    wire.feed("12345;0001;00000a00;08;7f;1e;0;0;00;0;00;0\n");
    wire.feed("_____127;0001;00000b00;01;00;00;0;0;01;0;00;0\n\n");
    rru.read(&ctx).unwrap();
    {
        let seen = seen.lock();
        assert_eq!(2, seen.len());
        assert_eq!("0", seen[0].index);
        assert_eq!("12345", seen[0].refid);
        assert_eq!("C1", seen[0].chan);
        assert_eq!("A-123", seen[0].source);
        assert_eq!("12h00:10.0000", seen[0].rawtime(4));
        assert_eq!("1", seen[1].index);
        assert_eq!("", seen[1].refid);
        assert_eq!("C2", seen[1].chan);
        assert_eq!("12h00:11.0000", seen[1].rawtime(4));
    }

    rru.read(&ctx).unwrap();
    assert_eq!(b"PASSINGGET;00000002\n".to_vec(), wire.take_written());
}

#[test]
fn stale_config_is_rewritten() {
    let (mut rru, ctx, wire, _) = attached(RruConf::default());
    wire.take_written();
    wire.feed("CONFGET;00\n05;05\n0b;01\n\n");
    rru.read(&ctx).unwrap();
    assert_eq!("CONFSET;05;06\n", wire.written_str());
}

#[test]
fn site_survey_picks_a_channel() {
    let mut cfg = RruConf::default();
    cfg.decoderconfig
        .insert(String::from("Channel ID"), String::from("auto"));
    let (mut rru, ctx, wire, _) = attached(cfg);
    assert!(wire
        .take_written()
        .ends_with(b"SITESURVEY\nEPOCHREFGET\nTIMESTAMPGET\nCONFGET;07\nPASSINGINFOGET\n"));

    wire.feed("SITESURVEY;00\n00;05\n01;02\n02;09\n\n");
    rru.read(&ctx).unwrap();
    assert_eq!(b"CONFSET;06;01\n".to_vec(), wire.take_written());

    // the surveyed channel survives a later sane
    rru.sane(&ctx).unwrap();
    let out = wire.written_str();
    assert!(out.contains("CONFSET;06;01\n"));
    assert!(!out.contains("SITESURVEY"));
}

#[test]
fn sync_pulses_dtr_after_setting_the_reference() {
    let (mut rru, ctx, wire, _) = attached(RruConf::default());
    wire.take_written();
    rru.sync(&ctx).unwrap();
    let out = wire.written_str();
    assert!(out.starts_with("EPOCHREFSET;"));
    let hex = out.trim_end().trim_start_matches("EPOCHREFSET;");
    assert_eq!(8, hex.len());
    let secs = i64::from_str_radix(hex, 16).unwrap();
    assert!((0..86400).contains(&secs));
    assert_eq!(vec![true, false], wire.dtr());
}
