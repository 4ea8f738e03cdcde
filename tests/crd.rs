//! CRD manifest sanity: both kinds serve `nixos.infra/v1alpha1` with a
//! status subresource, so the engine's status patches address a real
//! subresource path.

use kube::CustomResourceExt;
use nixos_operator::api::{Machine, NixosConfiguration};

#[test]
fn machine_crd_shape() {
    let crd = Machine::crd();
    assert_eq!(crd.spec.group, "nixos.infra");
    assert_eq!(crd.spec.names.kind, "Machine");
    assert_eq!(crd.spec.names.plural, "machines");

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version.served);
    assert!(
        version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some(),
        "status must be a subresource"
    );
}

#[test]
fn configuration_crd_shape() {
    let crd = NixosConfiguration::crd();
    assert_eq!(crd.spec.group, "nixos.infra");
    assert_eq!(crd.spec.names.plural, "nixosconfigurations");
    assert_eq!(
        crd.spec.names.short_names.as_deref().unwrap_or_default(),
        ["nixcfg"]
    );

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());
}

#[test]
fn spec_fields_are_camel_case_on_the_wire() {
    let config: NixosConfiguration = serde_json::from_value(serde_json::json!({
        "apiVersion": "nixos.infra/v1alpha1",
        "kind": "NixosConfiguration",
        "metadata": {"name": "c1", "namespace": "default"},
        "spec": {
            "gitRepo": "https://git.example.com/infra.git",
            "gitRef": "main",
            "flake": "#web01",
            "fullInstall": false,
            "machineRef": {"name": "m1"},
            "additionalFiles": [
                {"path": "etc/x.conf", "inline": "hello\n"},
                {"path": "facts/machine.env", "hardwareFacts": true}
            ],
            "onRemoveFlake": "#minimal"
        }
    }))
    .expect("camelCase spec must deserialize");

    assert_eq!(config.spec.git_ref, "main");
    assert_eq!(config.spec.on_remove_flake.as_deref(), Some("#minimal"));
    assert_eq!(config.spec.additional_files.len(), 2);
    assert!(config.spec.additional_files[1].hardware_facts);

    let wire = serde_json::to_value(&config.spec).unwrap();
    assert!(wire.get("gitRepo").is_some());
    assert!(wire.get("machineRef").is_some());
    assert!(wire.get("git_repo").is_none());
}
