use serial_test::serial;

use locality_coll::config::{CommTag, ENV_PPN, ENV_TAG_BASE, LocalityConfig, NodeGrouping};
use locality_coll::locality_error::LocalityError;

fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    // SAFETY: every test touching the environment is #[serial]
    unsafe {
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
    }
    let out = f();
    unsafe {
        std::env::remove_var(ENV_PPN);
        std::env::remove_var(ENV_TAG_BASE);
    }
    out
}

#[test]
#[serial]
fn defaults_without_environment() {
    let cfg = with_env(&[], LocalityConfig::from_env).unwrap();
    assert_eq!(cfg, LocalityConfig::default());
    assert_eq!(cfg.grouping, NodeGrouping::SharedMemory);
}

#[test]
#[serial]
fn ppn_forces_fixed_grouping() {
    let cfg = with_env(&[(ENV_PPN, " 4 ")], LocalityConfig::from_env).unwrap();
    assert_eq!(cfg.grouping, NodeGrouping::FixedPpn(4));
}

#[test]
#[serial]
fn tag_base_accepts_hex_and_decimal() {
    let hex = with_env(&[(ENV_TAG_BASE, "0x5000")], LocalityConfig::from_env).unwrap();
    assert_eq!(hex.tag_base, CommTag::new(0x5000));
    let dec = with_env(&[(ENV_TAG_BASE, "300")], LocalityConfig::from_env).unwrap();
    assert_eq!(dec.tag_base, CommTag::new(300));
    assert_eq!(dec.tags().scatter.as_u16(), 307);
}

#[test]
#[serial]
fn invalid_values_are_rejected() {
    for (k, v) in [
        (ENV_PPN, "many"),
        (ENV_PPN, "0"),
        (ENV_TAG_BASE, "0xZZ"),
        (ENV_TAG_BASE, "70000"),
        (ENV_TAG_BASE, "0xFFFE"),
    ] {
        let res = with_env(&[(k, v)], LocalityConfig::from_env);
        assert!(
            matches!(res, Err(LocalityError::InvalidArguments(_))),
            "{k}={v} accepted"
        );
    }
}

#[test]
fn config_survives_json() {
    let cfg = LocalityConfig::default()
        .with_grouping(NodeGrouping::FixedPpn(8))
        .with_tag_base(CommTag::new(0x6000));
    let text = serde_json::to_string(&cfg).unwrap();
    assert!(text.contains("FixedPpn"));
    let back: LocalityConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back, cfg);
}
