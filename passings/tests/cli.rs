use argh::FromArgs;
use decoder::cfg::SysConf;
use passings::{passing_line, CliArgs, Kind, Request};
use std::time::Duration;
use todtools::Tod;

#[test]
fn parse_args() {
    let args = CliArgs::from_args(
        &["passings"],
        &["timy", "--port", "/dev/ttyUSB0", "--arm", "C1", "--arm", "C2", "--armlock", "--sane"],
    )
    .unwrap();
    assert_eq!(Some(Kind::Timy), args.kind);
    assert_eq!(Some(String::from("/dev/ttyUSB0")), args.port);
    assert_eq!(vec!["C1", "C2"], args.arm);
    assert!(args.armlock);
    assert!(args.sane);
    assert!(!args.sync);
    assert_eq!(None, args.duration);

    let args = CliArgs::from_args(&["passings"], &["-v"]).unwrap();
    assert!(args.version);
    assert_eq!(None, args.kind);

    let args =
        CliArgs::from_args(&["passings"], &["rrs", "-p", "192.168.1.5:3601", "--json"]).unwrap();
    assert_eq!(Some(Kind::Rrs), args.kind);
    assert_eq!(Some(String::from("192.168.1.5:3601")), args.port);
    assert!(args.json);

    assert!(CliArgs::from_args(&["passings"], &["chronoprinter"]).is_err());
    assert!(CliArgs::from_args(&["passings"], &["timy", "/dev/ttyUSB0"]).is_err());
}

#[test]
fn parse_requests() {
    assert_eq!(Request::Sane, "sane".parse::<Request>().unwrap());
    assert_eq!(Request::Start, " START ".parse::<Request>().unwrap());
    assert_eq!(
        Request::Write(String::from("DTP hello world")),
        "write DTP hello world".parse::<Request>().unwrap()
    );
    assert_eq!(Request::Port(None), "port".parse::<Request>().unwrap());
    assert_eq!(
        Request::Port(Some(String::from("192.168.1.5"))),
        "port 192.168.1.5".parse::<Request>().unwrap()
    );
    assert_eq!(Request::Replay(String::new()), "replay".parse::<Request>().unwrap());
    assert!("arm".parse::<Request>().is_err());
    assert!("".parse::<Request>().is_err());
    assert!("launch".parse::<Request>().is_err());
}

#[test]
fn passing_columns() {
    let t: Tod = "9:05:07.12345".parse().unwrap();
    let t = t.tagged("12", "C1", "00123", "BoxA");
    assert_eq!("12\tC1\t00123\t9h05:07.1234\tBoxA", passing_line(&t));
}

#[test]
fn manual_trigger_on_an_armed_timy() {
    let device = passings::start(Kind::Timy, &SysConf::default()).unwrap();
    let (tx, rx) = flume::unbounded();
    device.handle.setcb(move |t| {
        let _ = tx.send(t);
    });
    assert!(device.apply(&Request::Arm(String::from("C0"))));
    assert!(device.apply(&Request::Trig(String::from("C0"))));
    assert!(device.apply(&Request::Trig(String::from("C0"))));
    device.handle.wait();
    let t = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!("C0", t.chan);
    assert_eq!("manual", t.source);
    assert!(rx.try_recv().is_err());
    assert!(!device.apply(&Request::Quit));
}

#[test]
fn arming_needs_a_timy() {
    let device = passings::start(Kind::Rrs, &SysConf::default()).unwrap();
    assert!(device.arming.is_none());
    assert!(device.apply(&Request::Arm(String::from("C1"))));
    device.handle.exit(None);
    device.handle.join();
}
