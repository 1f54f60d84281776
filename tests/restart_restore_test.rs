//! Restart behavior: everything the state file tracks survives a rebuild.

use sunward::clients::Credentials;
use sunward::config::Config;
use sunward::controller::ChargeController;
use sunward::settings::SettingsUpdate;

fn config_with(path: &std::path::Path) -> Config {
    Config {
        state_file: path.to_str().unwrap().to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn settings_and_override_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let (mut controller, _rx) = ChargeController::new(config_with(&path)).unwrap();
        controller.set_manual_override(12);
        controller.update_settings(&SettingsUpdate {
            target_soc: Some(90),
            daily_grid_budget_kwh: Some(8.0),
            ..Default::default()
        });
    }

    let (controller, _rx) = ChargeController::new(config_with(&path)).unwrap();
    let status = controller.status();
    assert_eq!(status.manual_override_amps, Some(12));
    assert_eq!(controller.settings().target_soc, 90);
    assert_eq!(status.budget.total_kwh, 8.0);
}

#[tokio::test]
async fn credentials_survive_restart_and_stay_masked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let (mut controller, _rx) = ChargeController::new(config_with(&path)).unwrap();
        controller
            .update_credentials(&Credentials {
                tessie_api_key: "secret-token-1234".to_string(),
                tessie_vin: "5YJ3000000NEXUS01".to_string(),
                ..Default::default()
            })
            .unwrap();
    }

    let (controller, _rx) = ChargeController::new(config_with(&path)).unwrap();
    let masked = controller.credentials_masked();
    // The stored key round-trips but reads come back masked
    assert!(masked.tessie_api_key.ends_with("1234"));
    assert!(masked.tessie_api_key.starts_with('•'));
    assert_eq!(masked.tessie_vin, "5YJ3000000NEXUS01");
}

#[tokio::test]
async fn corrupt_state_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{definitely not json").unwrap();

    let (controller, _rx) = ChargeController::new(config_with(&path)).unwrap();
    assert_eq!(controller.settings().target_soc, 80);
    assert!(controller.status().manual_override_amps.is_none());
}
