use std::fs;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rwkv_rs::model::random_named_tensors;
use rwkv_rs::{ArchVariant, ErrorFlags, HostTensor, RwkvConfig, RwkvModel, Shape};

#[test]
fn config_round_trips_through_a_json_file() {
    let config = RwkvConfig::v5(64, 16, 3, 8, 2);
    let path = std::env::temp_dir().join(format!("rwkv-rs-config-{}.json", std::process::id()));
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let loaded = RwkvConfig::from_json_file(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(loaded, config);
    assert_eq!(loaded.variant(), ArchVariant::V5);
    assert_eq!(loaded.state_len(), 16 * (2 + 8) * 3);
}

#[test]
fn missing_config_file_reports_the_path() {
    let path = std::env::temp_dir().join("rwkv-rs-config-does-not-exist.json");
    let err = RwkvConfig::from_json_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("rwkv-rs-config-does-not-exist.json"));
}

#[test]
fn state_len_for_reference_model_sizes() {
    for (n_embed, n_layer) in [(768, 12), (1024, 24), (2048, 24)] {
        let v4 = RwkvConfig::v4(50277, n_embed, n_layer);
        assert_eq!(v4.state_len(), n_embed * 5 * n_layer);
        let v5 = RwkvConfig::v5(65536, n_embed, n_layer, 64, 2);
        assert_eq!(v5.state_len(), n_embed * 66 * n_layer);
    }
    assert_eq!(RwkvConfig::v4(50277, 768, 12).state_len(), 46080);
}

#[test]
fn checkpoint_with_wrong_embedding_is_rejected() {
    let config = RwkvConfig::v4(16, 8, 1);
    let mut tensors = random_named_tensors(&config, &mut StdRng::seed_from_u64(1));
    tensors.insert(
        "emb.weight".to_string(),
        HostTensor::zeros(Shape::new([8, 15])),
    );
    let err = RwkvModel::from_named_tensors(config, tensors).unwrap_err();
    assert_eq!(err.flags(), ErrorFlags::MODEL_PARAMS | ErrorFlags::SHAPE);
}
