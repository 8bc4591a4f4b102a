mod common;

use std::fs;
use std::path::Path;

use common::mock_engine;
use iesopt::bridge::mock::MockRuntime;
use iesopt::scaffold::{copy_example, examples, list_examples, make_example};
use tempfile::TempDir;

/// An examples folder with two models and a shared data folder.
fn library() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("01_basic_single_node.iesopt.yaml"), "config: basic\n").unwrap();
    fs::write(dir.path().join("02_advanced.iesopt.yaml"), "config: advanced\n").unwrap();
    fs::write(dir.path().join("README.md"), "not an example\n").unwrap();
    fs::create_dir_all(dir.path().join("files/timeseries")).unwrap();
    fs::write(dir.path().join("files/timeseries/demand.csv"), "t,demand\n1,5\n").unwrap();
    dir
}

#[cfg(unix)]
fn make_read_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444)).unwrap();
}

#[cfg(unix)]
fn is_owner_writable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o200 != 0
}

#[test]
fn lists_examples_sorted_without_suffix() {
    let lib = library();

    let names = list_examples(lib.path()).unwrap();

    assert_eq!(names, vec!["01_basic_single_node", "02_advanced"]);
}

#[test]
fn listing_missing_folder_fails() {
    let dir = TempDir::new().unwrap();
    assert!(list_examples(&dir.path().join("nope")).is_err());
}

#[test]
fn copies_model_and_data_folder() {
    let lib = library();
    let dst = TempDir::new().unwrap();

    let path = copy_example(lib.path(), "02_advanced", dst.path(), None).unwrap();

    assert_eq!(path, dst.path().join("02_advanced.iesopt.yaml"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "config: advanced\n");
    assert_eq!(
        fs::read_to_string(dst.path().join("files/timeseries/demand.csv")).unwrap(),
        "t,demand\n1,5\n"
    );
}

#[test]
fn renames_copy_and_creates_target_dir() {
    let lib = library();
    let dst = TempDir::new().unwrap();
    let target_dir = dst.path().join("nested/project");

    let path = copy_example(lib.path(), "01_basic_single_node", &target_dir, Some("mine")).unwrap();

    assert_eq!(path, target_dir.join("mine.iesopt.yaml"));
    assert!(path.is_file());
    assert!(target_dir.join("files").is_dir());
}

#[test]
fn existing_data_folder_is_left_alone() {
    let lib = library();
    let dst = TempDir::new().unwrap();
    fs::create_dir(dst.path().join("files")).unwrap();
    fs::write(dst.path().join("files/local.csv"), "mine\n").unwrap();

    copy_example(lib.path(), "02_advanced", dst.path(), None).unwrap();

    assert_eq!(fs::read_to_string(dst.path().join("files/local.csv")).unwrap(), "mine\n");
    assert!(!dst.path().join("files/timeseries").exists());
}

#[test]
fn copying_twice_overwrites_model_only() {
    let lib = library();
    let dst = TempDir::new().unwrap();

    copy_example(lib.path(), "02_advanced", dst.path(), Some("work")).unwrap();
    fs::write(dst.path().join("files/timeseries/demand.csv"), "edited\n").unwrap();
    copy_example(lib.path(), "01_basic_single_node", dst.path(), Some("work")).unwrap();

    assert_eq!(
        fs::read_to_string(dst.path().join("work.iesopt.yaml")).unwrap(),
        "config: basic\n"
    );
    assert_eq!(
        fs::read_to_string(dst.path().join("files/timeseries/demand.csv")).unwrap(),
        "edited\n"
    );
}

#[test]
fn unknown_example_is_an_error() {
    let lib = library();
    let dst = TempDir::new().unwrap();

    let err = copy_example(lib.path(), "99_missing", dst.path(), None).unwrap_err();

    assert!(err.to_string().contains("unknown example `99_missing`"));
    assert!(fs::read_dir(dst.path()).unwrap().next().is_none());
}

#[cfg(unix)]
#[test]
fn copies_are_owner_writable() {
    let lib = library();
    make_read_only(&lib.path().join("02_advanced.iesopt.yaml"));
    make_read_only(&lib.path().join("files/timeseries/demand.csv"));
    let dst = TempDir::new().unwrap();

    let path = copy_example(lib.path(), "02_advanced", dst.path(), None).unwrap();

    assert!(is_owner_writable(&path));
    assert!(is_owner_writable(&dst.path().join("files/timeseries/demand.csv")));
    assert!(is_owner_writable(&dst.path().join("files/timeseries")));
}

#[tokio::test]
async fn examples_come_from_engine_library() {
    let lib = library();
    let (runtime, handle) = mock_engine(MockRuntime::new().with_examples_dir(lib.path()));

    let names = examples(&handle).await.unwrap();

    assert_eq!(names, vec!["01_basic_single_node", "02_advanced"]);
    assert_eq!(runtime.call_count("IESopt.IESoptLib.get_path"), 1);
}

#[tokio::test]
async fn make_example_copies_from_engine_library() {
    let lib = library();
    let dst = TempDir::new().unwrap();
    let (_runtime, handle) = mock_engine(MockRuntime::new().with_examples_dir(lib.path()));

    let path = make_example(&handle, "01_basic_single_node", dst.path(), None)
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(path).unwrap(), "config: basic\n");
}

#[tokio::test]
async fn engine_without_library_is_reported() {
    let (_runtime, handle) = mock_engine(MockRuntime::new());

    let err = examples(&handle).await.unwrap_err();

    assert!(err.to_string().contains("example library"));
}

#[test]
fn copying_onto_itself_is_refused() {
    let lib = library();
    let model = lib.path().join("02_advanced.iesopt.yaml");

    let err = copy_example(lib.path(), "02_advanced", lib.path(), None).unwrap_err();

    assert!(err.to_string().contains("are the same file"));
    assert_eq!(fs::read_to_string(&model).unwrap(), "config: advanced\n");
}

#[test]
fn copying_onto_itself_through_another_path_is_refused() {
    let lib = library();
    let detour = lib.path().join("files").join("..");

    assert!(copy_example(lib.path(), "01_basic_single_node", &detour, None).is_err());
    assert_eq!(
        fs::read_to_string(lib.path().join("01_basic_single_node.iesopt.yaml")).unwrap(),
        "config: basic\n"
    );
}

#[cfg(unix)]
#[test]
fn existing_data_folder_is_made_writable() {
    let lib = library();
    let dst = TempDir::new().unwrap();
    fs::create_dir(dst.path().join("files")).unwrap();
    let local = dst.path().join("files/local.csv");
    fs::write(&local, "mine\n").unwrap();
    make_read_only(&local);

    copy_example(lib.path(), "02_advanced", dst.path(), None).unwrap();

    assert!(is_owner_writable(&local));
}
