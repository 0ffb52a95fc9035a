//! Camera array on the simulated SDK.

mod common;

use common::{read_lines, template_dir};
use multilog::config::CameraUnitConfig;
use multilog::hardware::SimulatedCameraSdk;
use multilog::instrument::{CameraArrayDevice, Instrument};
use multilog::measurement::now;
use multilog::DaqError;

fn units(count: usize) -> Vec<CameraUnitConfig> {
    (0..count)
        .map(|i| CameraUnitConfig {
            exposure_time: 5000.0 + i as f64 * 1000.0,
            frame_rate: 2.0,
            timeout: 40,
            comment: Some("crucible top view".to_string()),
        })
        .collect()
}

#[tokio::test]
async fn test_failing_unit_leaves_an_empty_field() {
    let out = tempfile::tempdir().unwrap();
    let sdk = SimulatedCameraSdk::new(3).with_failing_unit(1);
    let mut device = CameraArrayDevice::connect("Basler", &units(3), &sdk, &template_dir()).unwrap();
    device.init_output(out.path()).unwrap();

    for i in 0..2 {
        assert_eq!(device.unit_ids(), [0, 1, 2]);
        let sample = device.sample().await.unwrap();
        let frames = sample.frames().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_ok());
        assert!(!frames[1].is_ok());
        assert!(frames[2].is_ok());
        device.save_measurement(&now(), i as f64 * 0.5, sample).unwrap();
    }
    assert_eq!(device.image_counter(), 3);

    let image_dir = out.path().join("Basler");
    let lines = read_lines(&image_dir.join("_images.csv"));
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "# datetime,s,filename,filename,filename,");
    assert_eq!(lines[1], "time_abs,time_rel,img-name_cam0,img-name_cam1,img-name_cam2,");
    assert!(lines[2].ends_with(",0.0,img_000001_cam0.jpg,,img_000001_cam2.jpg,"));
    assert!(lines[3].ends_with(",0.5,img_000002_cam0.jpg,,img_000002_cam2.jpg,"));

    for name in ["img_000001_cam0.jpg", "img_000001_cam2.jpg", "img_000002_cam2.jpg"] {
        let image = image::open(image_dir.join(name)).unwrap();
        assert_eq!((image.width(), image.height()), (64, 48));
    }
    assert!(!image_dir.join("img_000001_cam1.jpg").exists());

    let listing = read_lines(&image_dir.join("device.txt"));
    assert_eq!(listing.len(), 3);
    assert!(listing[1].starts_with("cam1: Simulated acA1300-30gc (serial SIM22001"));

    device.write_archive_fragment(out.path()).unwrap();
    let archive = std::fs::read_to_string(out.path().join("Basler.archive.yaml")).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&archive).unwrap();
    let data = &doc["data"];
    assert_eq!(data["images_list"].as_sequence().unwrap().len(), 4);
    assert_eq!(data["cameras"].as_sequence().unwrap().len(), 3);
    assert_eq!(data["comment"], serde_yaml::Value::from("crucible top view"));
    assert_eq!(
        data["images_list"][1]["image"],
        serde_yaml::Value::from("Basler/img_000001_cam2.jpg")
    );

    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_camera_uses_plain_names() {
    let out = tempfile::tempdir().unwrap();
    let sdk = SimulatedCameraSdk::new(1);
    let mut device = CameraArrayDevice::connect("Overview", &units(1), &sdk, &template_dir()).unwrap();
    device.init_output(out.path()).unwrap();

    let sample = device.sample().await.unwrap();
    device.save_measurement(&now(), 0.0, sample).unwrap();

    let lines = read_lines(&out.path().join("Overview").join("_images.csv"));
    assert_eq!(lines[1], "time_abs,time_rel,img-name,");
    assert!(lines[2].ends_with(",0.0,img_000001.jpg,"));
    assert!(out.path().join("Overview").join("img_000001.jpg").is_file());
}

#[tokio::test]
async fn test_existing_output_directory_is_refused() {
    let out = tempfile::tempdir().unwrap();
    std::fs::create_dir(out.path().join("Basler")).unwrap();
    std::fs::write(out.path().join("Basler").join("_images.csv"), "keep\n").unwrap();

    let sdk = SimulatedCameraSdk::new(2);
    let mut device = CameraArrayDevice::connect("Basler", &units(2), &sdk, &template_dir()).unwrap();
    let err = device.init_output(out.path()).unwrap_err();
    assert!(matches!(err, DaqError::OutputExists(_)));
    assert_eq!(
        std::fs::read_to_string(out.path().join("Basler").join("_images.csv")).unwrap(),
        "keep\n"
    );
}

#[tokio::test]
async fn test_unit_timeout_bounds_sample_duration() {
    let sdk = SimulatedCameraSdk::new(2).with_failing_unit(0).with_failing_unit(1);
    let mut device = CameraArrayDevice::connect("Basler", &units(2), &sdk, &template_dir()).unwrap();

    let started = std::time::Instant::now();
    let sample = device.sample().await.unwrap();
    assert!(sample.frames().unwrap().iter().all(|frame| !frame.is_ok()));
    assert!(started.elapsed() < std::time::Duration::from_millis(500));
}

#[tokio::test]
async fn test_unwritable_image_keeps_log_and_archive_in_step() {
    let out = tempfile::tempdir().unwrap();
    let sdk = SimulatedCameraSdk::new(3);
    let mut device = CameraArrayDevice::connect("Basler", &units(3), &sdk, &template_dir()).unwrap();
    device.init_output(out.path()).unwrap();

    // A directory squatting on cam1's first image name makes that save fail.
    let image_dir = out.path().join("Basler");
    std::fs::create_dir(image_dir.join("img_000001_cam1.jpg")).unwrap();

    let sample = device.sample().await.unwrap();
    device.save_measurement(&now(), 0.0, sample).unwrap();
    assert_eq!(device.image_counter(), 2);

    let sample = device.sample().await.unwrap();
    device.save_measurement(&now(), 0.5, sample).unwrap();

    let lines = read_lines(&image_dir.join("_images.csv"));
    assert!(lines[2].ends_with(",0.0,img_000001_cam0.jpg,,img_000001_cam2.jpg,"));
    assert!(lines[3].ends_with(",0.5,img_000002_cam0.jpg,img_000002_cam1.jpg,img_000002_cam2.jpg,"));

    let archive = std::fs::read_to_string(out.path().join("Basler.archive.yaml")).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&archive).unwrap();
    let names: Vec<&str> = doc["data"]["images_list"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        [
            "img_000001_cam0.jpg",
            "img_000001_cam2.jpg",
            "img_000002_cam0.jpg",
            "img_000002_cam1.jpg",
            "img_000002_cam2.jpg",
        ]
    );
}
