//! 附着流程集成测试

use pip_runtime::runtime::error::AttachError;
use pip_runtime::runtime::{BuiltinLoader, PipError, RuntimeBuilder};
use pip_runtime::util::config::RuntimeConfig;

use crate::common;

#[test]
fn test_root_address_round_trip() {
    let rt = common::root(2);
    for addr in [
        format!("{:#x}", rt.region_addr()),
        format!("{:x}", rt.region_addr()),
        format!("0X{:X}", rt.region_addr()),
    ] {
        // the region is valid but the test thread owns no slot
        let err = RuntimeBuilder::new()
            .config(common::config())
            .loader(BuiltinLoader)
            .attach(&addr)
            .unwrap_err();
        assert!(
            matches!(err, PipError::Attach(AttachError::SlotNotFound)),
            "{addr}: {err}"
        );
    }
}

#[test]
fn test_garbage_address() {
    let config = RuntimeConfig {
        root_addr: Some("not-hex".to_string()),
        ..common::config()
    };
    let err = RuntimeBuilder::new().config(config).init().unwrap_err();
    assert!(matches!(err, PipError::Attach(AttachError::BadAddress(_))));
    assert_eq!(err.errno(), libc::EPERM);
}
