use std::path::PathBuf;

use semantic_cyclegan::data::Batch;
use semantic_cyclegan::models::{MaskPatchModel, TrainingModel};
use semantic_cyclegan::{MaskError, TrainConfig};
use tch::{Device, IndexOp, Kind, Tensor};

const SIZE: i64 = 32;

fn small_config() -> TrainConfig {
    let mut config = TrainConfig {
        device: "cpu".into(),
        crop_size: SIZE,
        ngf: 4,
        ndf: 4,
        n_layers_d: 2,
        n_blocks_g: 1,
        ..Default::default()
    };
    config.mask_patch.use_disc_patch = true;
    config.mask_patch.use_context_g = true;
    config
}

fn labels(y: (i64, i64), x: (i64, i64)) -> Tensor {
    let labels = Tensor::zeros([2, SIZE, SIZE], (Kind::Int64, Device::Cpu));
    let _ = labels.i((.., y.0..y.1, x.0..x.1)).fill_(1);
    labels
}

fn batch(label_a: Option<Tensor>, label_b: Option<Tensor>) -> Batch {
    Batch {
        a: Tensor::rand([2, 3, SIZE, SIZE], (Kind::Float, Device::Cpu)) * 2.0 - 1.0,
        b: Tensor::rand([2, 3, SIZE, SIZE], (Kind::Float, Device::Cpu)) * 2.0 - 1.0,
        label_a,
        label_b,
        a_paths: vec![PathBuf::from("a0.png"), PathBuf::from("a1.png")],
        b_paths: vec![PathBuf::from("b0.png"), PathBuf::from("b1.png")],
    }
}

fn loss(model: &dyn TrainingModel, name: &str) -> f64 {
    model
        .current_losses()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("missing loss {}", name))
}

fn visual(model: &dyn TrainingModel, name: &str) -> Tensor {
    model
        .current_visuals()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("missing visual {}", name))
}

#[test]
fn one_step_reports_every_loss() {
    let mut model = MaskPatchModel::new(&small_config()).unwrap();
    model
        .set_input(batch(Some(labels((4, 20), (8, 28))), Some(labels((10, 30), (2, 12)))))
        .unwrap();
    model.optimize_parameters().unwrap();

    let names: Vec<&str> = model.current_losses().iter().map(|(n, _)| *n).collect();
    assert_eq!(
        names,
        vec![
            "D_A_full", "G_A", "cycle_A", "idt_A", "D_B_full", "G_B", "cycle_B", "idt_B", "G_A_2",
            "G_B_2", "D_A_patch", "D_B_patch"
        ]
    );
    for (name, value) in model.current_losses() {
        assert!(value.is_finite(), "{} is not finite", name);
    }
    assert!(loss(&model, "D_A_full") >= 0.0);
    assert!(loss(&model, "idt_A") > 0.0);
    assert_eq!(visual(&model, "full_fake_B").size(), vec![2, 3, SIZE, SIZE]);
}

#[test]
fn composite_keeps_the_real_image_outside_the_box() {
    let mut model = MaskPatchModel::new(&small_config()).unwrap();
    let label_a = labels((4, 20), (8, 28));
    model
        .set_input(batch(Some(label_a.shallow_clone()), Some(labels((0, 16), (0, 16)))))
        .unwrap();
    model.optimize_parameters().unwrap();

    let full_real_a = visual(&model, "full_real_A");
    let full_fake_b = visual(&model, "full_fake_B");
    let outside = label_a.eq(0).unsqueeze(1).to_kind(Kind::Float);
    assert!((&full_fake_b * &outside).allclose(&(&full_real_a * &outside), 1e-6, 1e-6, false));
}

#[test]
fn identity_losses_are_zero_without_identity_weight() {
    let mut config = small_config();
    config.lambda_identity = 0.0;
    let mut model = MaskPatchModel::new(&config).unwrap();
    model
        .set_input(batch(Some(labels((4, 20), (8, 28))), Some(labels((0, 16), (0, 16)))))
        .unwrap();
    model.optimize_parameters().unwrap();

    assert_eq!(loss(&model, "idt_A"), 0.0);
    assert_eq!(loss(&model, "idt_B"), 0.0);
    assert!(model.current_visuals().iter().all(|(n, _)| *n != "idt_A"));
}

#[test]
fn labels_are_required_for_both_domains() {
    let mut model = MaskPatchModel::new(&small_config()).unwrap();
    let err = model
        .set_input(batch(Some(labels((0, 8), (0, 8))), None))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MaskError>(),
        Some(MaskError::MissingLabel { domain: 'B' })
    ));
}

#[test]
fn empty_masks_are_rejected() {
    let mut model = MaskPatchModel::new(&small_config()).unwrap();
    let empty = Tensor::zeros([2, SIZE, SIZE], (Kind::Int64, Device::Cpu));
    let err = model
        .set_input(batch(Some(empty), Some(labels((0, 8), (0, 8)))))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MaskError>(),
        Some(MaskError::EmptyMask { index: 0 })
    ));
}

#[test]
fn networks_round_trip_through_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config();
    let model = MaskPatchModel::new(&config).unwrap();
    let written = model.save_networks(dir.path(), "latest").unwrap();
    assert_eq!(written.len(), 6);
    assert!(dir.path().join("latest_net_d_a_patch.ot").exists());

    let mut restored = MaskPatchModel::new(&config).unwrap();
    restored.load_networks(dir.path(), "latest").unwrap();
}
