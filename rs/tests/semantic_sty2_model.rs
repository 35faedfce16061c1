use std::path::PathBuf;

use semantic_cyclegan::config::Direction;
use semantic_cyclegan::data::Batch;
use semantic_cyclegan::losses::OutMaskLossKind;
use semantic_cyclegan::models::{SemanticStyleModel, TrainingModel};
use semantic_cyclegan::{ConfigError, MaskError, TrainConfig};
use tch::{Device, IndexOp, Kind, Tensor};

const SIZE: i64 = 16;

fn small_config() -> TrainConfig {
    let mut config = TrainConfig {
        device: "cpu".into(),
        crop_size: SIZE,
        ngf: 4,
        ndf: 4,
        n_layers_d: 2,
        n_blocks_g: 1,
        pool_size: 2,
        ..Default::default()
    };
    let semantic = &mut config.semantic;
    semantic.decoder_size = SIZE;
    semantic.latent_dim = 8;
    semantic.decoder_channels = 8;
    semantic.mapping_layers = 2;
    semantic.semantic_nclasses = 3;
    semantic.f_s_nf = 4;
    config
}

fn labels() -> Tensor {
    let labels = Tensor::zeros([2, SIZE, SIZE], (Kind::Int64, Device::Cpu));
    let _ = labels.i((.., 2..10, 4..12)).fill_(1);
    let _ = labels.i((.., 12..15, 0..6)).fill_(2);
    labels
}

fn batch(with_label_b: bool) -> Batch {
    Batch {
        a: Tensor::rand([2, 3, SIZE, SIZE], (Kind::Float, Device::Cpu)) * 2.0 - 1.0,
        b: Tensor::rand([2, 3, SIZE, SIZE], (Kind::Float, Device::Cpu)) * 2.0 - 1.0,
        label_a: Some(labels()),
        label_b: with_label_b.then(labels),
        a_paths: vec![PathBuf::from("a0.png"), PathBuf::from("a1.png")],
        b_paths: vec![PathBuf::from("b0.png"), PathBuf::from("b1.png")],
    }
}

fn loss(model: &SemanticStyleModel, name: &str) -> f64 {
    model
        .current_losses()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("missing loss {}", name))
}

fn train_step(model: &mut SemanticStyleModel, with_label_b: bool) {
    model.set_input(batch(with_label_b)).unwrap();
    model.optimize_parameters().unwrap();
}

#[test]
fn first_step_trains_classifier_with_semantic_losses_gated() {
    let mut model = SemanticStyleModel::new(&small_config()).unwrap();
    train_step(&mut model, false);

    assert_eq!(model.step_count(), 1);
    assert_eq!(loss(&model, "sem_AB"), 0.0);
    assert_eq!(loss(&model, "sem_BA"), 0.0);
    let f_s = model.last_classifier_loss().unwrap();
    assert_eq!(loss(&model, "f_s"), f_s);
    assert!(f_s > 0.0);
    for (name, value) in model.current_losses() {
        assert!(value.is_finite(), "{} is not finite", name);
    }
    assert_eq!(
        model.current_visuals().iter().find(|(n, _)| *n == "fake_B").unwrap().1.size(),
        vec![2, 3, SIZE, SIZE]
    );
}

#[test]
fn semantic_losses_stay_off_while_the_classifier_is_poor() {
    let mut model = SemanticStyleModel::new(&small_config()).unwrap();
    for _ in 0..3 {
        let before = model.last_classifier_loss();
        train_step(&mut model, true);
        if before.map_or(true, |l| l > 1.0) {
            assert_eq!(loss(&model, "sem_AB"), 0.0);
            assert_eq!(loss(&model, "sem_BA"), 0.0);
        } else {
            assert!(loss(&model, "sem_AB") > 0.0);
        }
    }
}

#[test]
fn regularizers_are_exact_zeros_off_interval() {
    let mut config = small_config();
    config.semantic.g_reg_every = 4;
    config.semantic.d_reg_every = 16;
    let mut model = SemanticStyleModel::new(&config).unwrap();

    // counter 0: path length is due, R1 runs at counter 1 and is not
    train_step(&mut model, true);
    assert!(loss(&model, "weighted_path_A") >= 0.0);
    let means = model.mean_path_lengths();
    assert!(means.0 > 0.0 && means.1 > 0.0);
    assert_eq!(model.mean_path_length_averages(), means);
    assert_eq!(loss(&model, "d_dec_reg_A"), 0.0);

    train_step(&mut model, true);
    assert_eq!(loss(&model, "weighted_path_A"), 0.0);
    assert_eq!(loss(&model, "weighted_path_B"), 0.0);
    assert_eq!(loss(&model, "d_dec_reg_B"), 0.0);
    assert_eq!(model.mean_path_lengths(), means);
}

#[test]
fn r1_runs_when_due() {
    let mut config = small_config();
    config.semantic.d_reg_every = 1;
    config.semantic.path_regularize = 0.0;
    let mut model = SemanticStyleModel::new(&config).unwrap();
    train_step(&mut model, true);

    assert!(loss(&model, "d_dec_reg_A") > 0.0);
    assert!(loss(&model, "d_dec_reg_B") > 0.0);
    assert_eq!(loss(&model, "weighted_path_A"), 0.0);
    assert_eq!(model.mean_path_lengths(), (0.0, 0.0));
}

#[test]
fn mask_options_add_their_losses() {
    let mut config = small_config();
    config.semantic.disc_in_mask = true;
    config.semantic.out_mask = true;
    config.semantic.loss_out_mask = OutMaskLossKind::Charbonnier;
    config.semantic.train_f_s_b = true;
    let mut model = SemanticStyleModel::new(&config).unwrap();
    train_step(&mut model, true);

    let names: Vec<&str> = model.current_losses().iter().map(|(n, _)| *n).collect();
    assert_eq!(&names[..6], &["G_A_mask", "G_B_mask", "D_A_mask", "D_B_mask", "out_mask_AB", "out_mask_BA"]);
    assert!(loss(&model, "D_A_mask") >= 0.0);
    assert!(loss(&model, "out_mask_AB") > 0.0);
    assert!(model.current_visuals().iter().any(|(n, _)| *n == "fake_B_mask"));

    let err = model.set_input(batch(false)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MaskError>(),
        Some(MaskError::MissingLabel { domain: 'B' })
    ));
}

#[test]
fn classifier_on_b_needs_label_b_before_any_update() {
    let mut config = small_config();
    config.semantic.train_f_s_b = true;
    let mut model = SemanticStyleModel::new(&config).unwrap();

    let err = model.set_input(batch(false)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MaskError>(),
        Some(MaskError::MissingLabel { domain: 'B' })
    ));
    assert!(model.optimize_parameters().is_err());
    assert_eq!(model.step_count(), 0);

    train_step(&mut model, true);
    assert_eq!(model.step_count(), 1);
}

#[test]
fn latent_options_train_in_reverse_direction() {
    let mut config = small_config();
    config.direction = Direction::BtoA;
    config.semantic.wplus = true;
    config.semantic.truncation = 0.7;
    config.semantic.rec_noise = true;
    config.semantic.d_noise = true;
    config.lambda_identity = 0.0;
    let mut model = SemanticStyleModel::new(&config).unwrap();
    train_step(&mut model, false);

    assert_eq!(loss(&model, "idt_A"), 0.0);
    assert_eq!(model.image_paths()[0], PathBuf::from("b0.png"));
}

#[test]
fn decoder_size_must_match_crop_size() {
    let mut config = small_config();
    config.semantic.decoder_size = 32;
    let err = SemanticStyleModel::new(&config).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InvalidDecoderSize { .. })
    ));
}

#[test]
fn checkpoints_cover_every_network() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config();
    let model = SemanticStyleModel::new(&config).unwrap();
    let written = model.save_networks(dir.path(), "3").unwrap();
    assert_eq!(written.len(), 7);
    assert!(dir.path().join("3_net_d_dec_a.ot").exists());

    let mut restored = SemanticStyleModel::new(&config).unwrap();
    restored.load_networks(dir.path(), "3").unwrap();
}
