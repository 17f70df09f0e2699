//! Unit manager, driver registry and plugin scanning tests.

use camchain::buffer::FrameBuffer;
use camchain::chain::Chain;
use camchain::driver::{
    Description, DescriptionEvent, DriverBackend, DriverCore, DriverId, UnitDriver,
};
use camchain::error::{Error, Result};
use camchain::format::Format;
use camchain::manager::{ManagerConfig, UnitManager};
use camchain::plugin::PluginError;
use camchain::unit::{UnitFlags, UnitKind, UnitStatus};
use camchain::units::Passthrough;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Publishes one description per instance name.
struct Announced {
    instances: Vec<&'static str>,
}

impl DriverBackend for Announced {
    fn start(&mut self, core: &mut DriverCore) -> Result<()> {
        for &instance in &self.instances {
            // duplicates are rejected by the core; keep going
            let _ = core.add_description(instance, Some(instance), UnitFlags::NONE);
        }
        Ok(())
    }

    fn create_unit(&mut self, _description: &Description) -> Result<Box<dyn UnitKind>> {
        Ok(Box::new(Passthrough::new()))
    }
}

fn announced(package: &str, name: &str, instances: Vec<&'static str>) -> UnitDriver {
    UnitDriver::new(package, name, Box::new(Announced { instances }))
}

fn ids(descriptions: &[Arc<Description>]) -> Vec<String> {
    descriptions.iter().map(|d| d.id().to_string()).collect()
}

#[test]
fn test_builtin_descriptions() {
    let manager = UnitManager::new(ManagerConfig::builtin());
    assert_eq!(
        ids(&manager.descriptions()),
        vec![
            "input.test_pattern",
            "input.app",
            "filter.passthrough",
            "output.writer"
        ]
    );
    assert!(manager.plugin_dirs().is_empty());
}

#[test]
fn test_duplicate_description_keeps_original() {
    let mut manager = UnitManager::new(ManagerConfig::empty());
    let id = manager.add_driver(announced("input", "net", vec!["cam0", "cam0", "cam1"]));

    let descriptions = manager.driver(id).unwrap().descriptions().to_vec();
    assert_eq!(ids(&descriptions), vec!["input.net:cam0", "input.net:cam1"]);

    let driver = manager.driver_mut(id).unwrap();
    assert!(matches!(
        driver.add_description("again", Some("cam1"), UnitFlags::NONE),
        Err(Error::DuplicateDescription(dup)) if dup == "input.net:cam1"
    ));
    assert_eq!(driver.descriptions().len(), 2);
}

#[test]
fn test_description_events_relayed() {
    let mut manager = UnitManager::new(ManagerConfig::empty());
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    manager.subscribe(Box::new(move |event: &DescriptionEvent| {
        let tag = match event {
            DescriptionEvent::Added(_) => "+",
            DescriptionEvent::Removed(_) => "-",
        };
        l.lock()
            .unwrap()
            .push(format!("{}{}", tag, event.description().id()));
    }));

    let id = manager.add_driver(announced("input", "net", vec!["cam0"]));
    manager.remove_driver(id).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["+input.net:cam0", "-input.net:cam0"]);
    assert!(manager.find_description("input.net:cam0").is_none());
}

#[test]
fn test_start_drivers_is_idempotent() {
    let mut manager = UnitManager::new(ManagerConfig::builtin().with_start_drivers(false));
    assert!(manager.descriptions().is_empty());

    manager.start_drivers();
    manager.start_drivers();
    assert_eq!(manager.descriptions().len(), 4);

    // a driver added to a running manager starts right away, once
    let id = manager.add_driver(announced("input", "net", vec!["cam0"]));
    assert!(manager.is_started(id));
    manager.start_drivers();
    assert_eq!(manager.descriptions().len(), 5);

    manager.stop_drivers();
    assert!(manager.descriptions().is_empty());
    assert!(!manager.is_started(id));
}

#[test]
fn test_create_unit_by_id() {
    let mut manager = UnitManager::new(ManagerConfig::builtin());
    let unit = manager.create_unit_by_id("input.test_pattern").unwrap();
    assert_eq!(unit.id(), "input.test_pattern");
    assert_eq!(unit.name(), "Test pattern");
    assert!(unit.flags().contains(UnitFlags::TIMER_EVENT));
    assert!(unit.module().is_none());

    assert!(matches!(
        manager.create_unit_by_id("input.v4l2:/dev/video9"),
        Err(Error::DescriptionNotFound(_))
    ));
}

#[test]
fn test_list_package() {
    let mut manager = UnitManager::new(ManagerConfig::builtin());
    manager.add_driver(announced("input.usb", "uvc", vec!["0"]));
    manager.add_driver(announced("inputs", "other", vec!["0"]));
    manager.add_driver(announced("", "bare", vec!["0"]));

    assert_eq!(
        ids(&manager.list_package("input", false)),
        vec!["input.test_pattern", "input.app"]
    );
    assert_eq!(
        ids(&manager.list_package("input", true)),
        vec!["input.test_pattern", "input.app", "input.usb.uvc:0"]
    );
    assert!(manager.list_package("", true).iter().all(|d| d.id() != "bare:0"));
}

fn system_library() -> Option<PathBuf> {
    [
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/usr/lib/x86_64-linux-gnu/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib/aarch64-linux-gnu/libm.so.6",
        "/lib64/libm.so.6",
        "/usr/lib64/libm.so.6",
        "/usr/lib/libm.so.6",
    ]
    .iter()
    .map(Path::new)
    .find(|p| p.exists())
    .map(Path::to_path_buf)
}

/// Build the `filter.invert` plugin once per test binary.
fn fixture_plugin() -> &'static Path {
    static BUILT: OnceLock<PathBuf> = OnceLock::new();
    BUILT.get_or_init(|| {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/plugin_fixture/Cargo.toml");
        let target = Path::new(env!("CARGO_TARGET_TMPDIR")).join("plugin_fixture");
        let status = Command::new(env!("CARGO"))
            .args(["build", "--quiet", "--manifest-path"])
            .arg(&manifest)
            .arg("--target-dir")
            .arg(&target)
            .status()
            .unwrap();
        assert!(status.success(), "building the plugin fixture failed");
        let library = target.join("debug").join("libcamchain_plugin_fixture.so");
        assert!(library.exists(), "missing {}", library.display());
        library
    })
}

#[test]
fn test_bad_plugins_do_not_stop_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b_garbage.so"), b"not an ELF file").unwrap();
    std::fs::write(dir.path().join("c_truncated.so"), b"\x7fELF").unwrap();
    std::fs::write(dir.path().join(".hidden.so"), b"ignored").unwrap();
    std::fs::write(dir.path().join("libfoo.la"), b"ignored").unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();
    let real = system_library();
    if let Some(lib) = &real {
        std::fs::copy(lib, dir.path().join("a_no_entry_points.so")).unwrap();
    }
    // sorts after every broken candidate
    std::fs::copy(fixture_plugin(), dir.path().join("d_invert.so")).unwrap();

    let mut manager = UnitManager::new(ManagerConfig::builtin());
    let scan = manager.add_plugin_dir(dir.path());

    assert_eq!(scan.loaded, vec!["invert".to_string()]);
    let failed: Vec<String> = scan
        .failed
        .iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let mut expected = vec!["b_garbage.so", "c_truncated.so"];
    if real.is_some() {
        expected.insert(0, "a_no_entry_points.so");
        assert!(matches!(scan.failed[0].1, PluginError::MissingEntryPoint(_)));
    }
    assert_eq!(failed, expected);
    assert!(scan
        .failed
        .iter()
        .filter(|(path, _)| path.ends_with("b_garbage.so"))
        .all(|(_, e)| matches!(e, PluginError::LoadFailed(_))));

    assert_eq!(manager.plugin_dirs(), &[dir.path().to_path_buf()]);
    assert!(manager.find_description("filter.invert").is_some());
    assert!(manager.create_unit_by_id("filter.passthrough").is_ok());
}

#[test]
fn test_plugin_units_keep_module_loaded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(fixture_plugin(), dir.path().join("libinvert.so")).unwrap();

    let mut manager = UnitManager::new(ManagerConfig::builtin().with_plugin_dir(dir.path()));
    let ids: HashSet<DriverId> = manager.drivers().iter().map(|d| d.id()).collect();
    assert_eq!(ids.len(), 5);

    let driver = manager.drivers().iter().find(|d| d.name() == "invert").unwrap();
    let module = driver.module().unwrap().clone();
    assert_eq!(module.name(), "invert");
    assert_eq!(module.kinds(), &["filter.invert".to_string()]);

    let source = manager.create_unit_by_id("input.test_pattern").unwrap();
    let invert = manager.create_unit_by_id("filter.invert").unwrap();
    assert!(Arc::ptr_eq(invert.module().unwrap(), &module));
    assert!(source.module().is_none());

    // only the unit and this test still hold the module
    drop(manager);
    assert_eq!(Arc::strong_count(&module), 2);

    let mut chain = Chain::new();
    chain.insert_tail(source).unwrap();
    chain.insert_tail(invert).unwrap();
    let first = Arc::new(Mutex::new(Vec::new()));
    let f = first.clone();
    chain.subscribe_frames(Box::new(move |frame: &FrameBuffer, _: &Format| {
        f.lock().unwrap().extend_from_slice(&frame.as_bytes()[..3]);
    }));
    chain.set_desired_status(UnitStatus::Streaming).unwrap();
    assert_eq!(chain.iterate(Some(Duration::from_millis(200))).unwrap(), 1);

    // 75% white bar, inverted by code living in the plugin
    assert_eq!(*first.lock().unwrap(), vec![64, 64, 64]);

    drop(chain);
    assert_eq!(Arc::strong_count(&module), 1);
}

#[test]
fn test_missing_plugin_dir_is_empty_scan() {
    let manager = UnitManager::new(
        ManagerConfig::builtin().with_plugin_dir("/nonexistent/camchain/plugins"),
    );
    assert_eq!(manager.descriptions().len(), 4);
    assert_eq!(manager.plugin_dirs().len(), 1);
}
