//! Chain snapshot save and restore tests.

use camchain::chain::Chain;
use camchain::error::Error;
use camchain::format::{FormatHint, PixelFormat};
use camchain::manager::{ManagerConfig, ManagerHandle, UnitManager};
use camchain::unit::{ControlValue, UnitStatus};

fn manager() -> ManagerHandle {
    UnitManager::new(ManagerConfig::builtin()).into_handle()
}

fn ids(chain: &Chain) -> Vec<&str> {
    chain.units().iter().map(|u| u.id()).collect()
}

fn control(chain: &Chain, index: usize, id: &str) -> ControlValue {
    chain.units()[index].control(id).unwrap().value().clone()
}

#[test]
fn test_snapshot_round_trip() {
    let manager = manager();
    let mut chain = Chain::with_manager(manager.clone());
    chain.set_desired_status(UnitStatus::Ready).unwrap();
    let source = chain.add_unit_by_id("input.test_pattern").unwrap();
    chain.add_unit_by_id("filter.passthrough").unwrap();
    chain.add_unit_by_id("output.writer").unwrap();

    let unit = chain.unit_mut(source).unwrap();
    unit.set_control("fps", ControlValue::Float(25.0)).unwrap();
    unit.set_control("pattern", ControlValue::Enum(2)).unwrap();
    unit.set_preferred_format(FormatHint::new().with_pixel_format(PixelFormat::Gray8));
    chain.set_unit_status(source, UnitStatus::Idle).unwrap();
    chain.set_unit_status(source, UnitStatus::Ready).unwrap();
    let xml = chain.snapshot().unwrap();
    assert!(xml.contains(r#"pixelformat="GRAY8""#));

    let mut restored = Chain::with_manager(manager);
    restored.load_from_str(&xml).unwrap();
    assert_eq!(
        ids(&restored),
        vec!["input.test_pattern", "filter.passthrough", "output.writer"]
    );
    assert!(restored.units().iter().all(|u| u.status() == UnitStatus::Ready));
    assert_eq!(control(&restored, 0, "fps"), ControlValue::Float(25.0));
    assert_eq!(control(&restored, 0, "pattern"), ControlValue::Enum(2));

    let format = restored.units()[2].output_format().unwrap();
    assert_eq!(format.pixel_format, PixelFormat::Gray8);
    assert_eq!((format.width, format.height), (640, 480));

    assert_eq!(restored.snapshot().unwrap(), xml);
}

#[test]
fn test_load_replaces_existing_units() {
    let manager = manager();
    let mut chain = Chain::with_manager(manager);
    chain.add_unit_by_id("filter.passthrough").unwrap();
    chain.add_unit_by_id("filter.passthrough").unwrap();

    chain
        .load_from_str(r#"<chain><unit id="input.test_pattern"/></chain>"#)
        .unwrap();
    assert_eq!(ids(&chain), vec!["input.test_pattern"]);
}

#[test]
fn test_unknown_control_is_skipped() {
    let mut chain = Chain::with_manager(manager());
    let xml = r#"
        <chain>
          <unit id="input.test_pattern">
            <control id="exposure">12</control>
            <control id="fps">10</control>
          </unit>
        </chain>"#;
    chain.load_from_str(xml).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(control(&chain, 0, "fps"), ControlValue::Float(10.0));
}

#[test]
fn test_rejected_control_value_keeps_default() {
    let mut chain = Chain::with_manager(manager());
    let xml = r#"<chain><unit id="input.test_pattern"><control id="fps">500</control></unit></chain>"#;
    chain.load_from_str(xml).unwrap();
    assert_eq!(control(&chain, 0, "fps"), ControlValue::Float(30.0));
}

#[test]
fn test_malformed_snapshots() {
    let cases = [
        r#"<chain><unit id="input.test_pattern" colour="red"/></chain>"#,
        r#"<chain><unit id="input.test_pattern" pixelformat="XYZW"/></chain>"#,
        r#"<chain><unit id="input.test_pattern" width="wide"/></chain>"#,
        r#"<chain><unit width="640"/></chain>"#,
        r#"<chain><unit id="input.test_pattern"><control id="fps">fast</control></unit></chain>"#,
        r#"<chain><unit id="input.test_pattern"><control name="fps">1</control></unit></chain>"#,
        r#"<chain><source id="input.test_pattern"/></chain>"#,
        r#"<chain><unit id="input.test_pattern"></chain>"#,
    ];
    for xml in cases {
        let mut chain = Chain::with_manager(manager());
        assert!(
            matches!(chain.load_from_str(xml), Err(Error::Snapshot(_))),
            "accepted: {xml}"
        );
    }
}

#[test]
fn test_unknown_unit_id_names_it() {
    let mut chain = Chain::with_manager(manager());
    let err = chain
        .load_from_str(r#"<chain><unit id="input.v4l2:/dev/video7"/></chain>"#)
        .unwrap_err();
    assert!(matches!(err, Error::Snapshot(msg) if msg.contains("input.v4l2:/dev/video7")));
}
