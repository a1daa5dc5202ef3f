use todtools::{special, Tod, TodList};

fn secs(s: i64) -> Tod {
    Tod::from_secs(s).unwrap()
}

#[test]
fn insert_keeps_time_order() {
    let mut l = TodList::new("lap");
    assert_eq!(0, l.insert(&secs(30), None, Some("4"), ""));
    assert_eq!(0, l.insert(&secs(20), None, Some("7"), ""));
    assert_eq!(2, l.insert(&secs(40), None, Some("1"), ""));
    // secondary time breaks the tie
    assert_eq!(2, l.insert(&secs(30), Some(&secs(5)), Some("9"), ""));
    let bibs: Vec<&str> = l.iter().map(|(p, _)| p.refid.as_str()).collect();
    assert_eq!(vec!["7", "4", "9", "1"], bibs);
    assert_eq!("lap", l[0].0.chan);
    assert_eq!(secs(5), l[2].1);
    assert_eq!(4, l.len());
}

#[test]
fn equal_times_go_first_and_share_a_rank() {
    let mut l = TodList::new("");
    l.insert(&secs(10), None, Some("1"), "");
    l.insert(&secs(12), None, Some("2"), "");
    assert_eq!(1, l.insert(&secs(12), None, Some("3"), "a"));
    l.insert(&secs(15), None, Some("4"), "");
    assert_eq!(Some(0), l.rank("1", ""));
    assert_eq!(Some(1), l.rank("3", "a"));
    assert_eq!(Some(1), l.rank("2", ""));
    assert_eq!(Some(3), l.rank("4", ""));
    assert_eq!(None, l.rank("3", ""));
}

#[test]
fn bib_defaults_to_the_index() {
    let mut l = TodList::new("fin");
    let t = secs(61).tagged("42", "C1", "", "timy");
    l.insert(&t, None, None, "");
    assert_eq!("42", l[0].0.refid);
    assert_eq!("", l[0].0.source);
    assert_eq!(Tod::ZERO, l[0].1);
}

#[test]
fn remove_and_renumber() {
    let mut l = TodList::new("");
    for s in [5, 6, 7] {
        l.insert(&secs(s), None, Some("8"), "");
    }
    l.insert(&secs(9), None, Some("2"), "");
    assert_eq!(1, l.remove("8", "", true));
    assert_eq!(3, l.len());
    assert_eq!(secs(6), l[0].0);
    assert_eq!(2, l.remove("8", "", false));
    assert_eq!(0, l.remove("8", "", false));

    l.changeno("2", "12", "", "b");
    assert_eq!(None, l.rank("2", ""));
    assert_eq!(Some(0), l.rank("12", "b"));
    l.clear();
    assert!(l.is_empty());
}

#[test]
fn placeholders_sort_around_real_times() {
    let mut l = TodList::new("");
    l.insert(&secs(100), None, Some("1"), "");
    assert_eq!(Some(1), l.insert_special("dnf", "2", ""));
    assert_eq!(Some(0), l.insert_special("catch", "3", ""));
    assert_eq!(Some(3), l.insert_special("dsq", "4", ""));
    assert_eq!(None, l.insert_special("late", "5", ""));
    let bibs: Vec<&str> = (&l).into_iter().map(|(p, _)| p.refid.as_str()).collect();
    assert_eq!(vec!["3", "1", "2", "4"], bibs);

    assert_eq!("caught", special("lose").unwrap().chan);
    assert!(special("catch").unwrap() < special("win").unwrap());
    assert!(special("dnf").unwrap() > Tod::MAX);
}
