//! Key-source descriptors and their TOML loading.
//!
//! A configuration path is either one TOML file holding a `[[keySource]]`
//! array, or a directory whose `*.toml` files each hold one descriptor.
//! Directory entries are read in file-name order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionParameters, Timeout, TlsOptions, TrustMode, TrustModeKind};
use crate::error::ConfigurationError;
use crate::provider::LoadOptions;
use crate::secret::SecretRef;
use crate::source::{
    AzureKeyVaultSource, AzureSecretId, FileSecretSource, HashicorpVaultSource, HsmKeyId,
    HsmModules, HsmSecretSource, KeyFilePath, KeySource, SourcedKey, VaultSecretId,
};

/// One configured key source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum KeySourceDescriptor {
    File {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encryption_password_source: Option<SecretRef>,
    },
    HashicorpVault {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<i64>,
        tls: TlsDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<i64>,
        secret_path: String,
        secret_key_field: String,
        token_source: SecretRef,
    },
    AzureKeyVault {
        vault_name: String,
        client_id: String,
        client_secret_ref: SecretRef,
        tenant_id: String,
        secret_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<i64>,
    },
    Hsm {
        library_path: PathBuf,
        slot: u64,
        key_alias: String,
        pin_source: SecretRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsDescriptor {
    pub trust_mode: TrustModeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_material: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "keySource")]
    key_sources: Vec<KeySourceDescriptor>,
}

impl KeySourceDescriptor {
    /// Validate the descriptor and build its key source. No backend is
    /// contacted here. `hsm` descriptors naming the same library share the
    /// module handed out by `hsm_modules`.
    pub fn into_key_source(
        self,
        options: &LoadOptions,
        hsm_modules: &HsmModules,
    ) -> Result<Box<dyn KeySource>, ConfigurationError> {
        match self {
            Self::File { path, encryption_password_source } => {
                let source = match encryption_password_source {
                    Some(password) => {
                        password.validate()?;
                        FileSecretSource::encrypted(password)
                    }
                    None => FileSecretSource::plain(),
                };
                Ok(Box::new(SourcedKey::new(source, KeyFilePath::new(path))))
            }
            Self::HashicorpVault {
                host,
                port,
                tls,
                timeout_ms,
                secret_path,
                secret_key_field,
                token_source,
            } => {
                let mut params = ConnectionParameters::builder(host);
                if let Some(port) = port {
                    params = params.port(port);
                }
                if let Some(timeout_ms) = timeout_ms {
                    params = params.timeout_ms(timeout_ms);
                }
                let mode = TrustMode::from_parts(tls.trust_mode, tls.trust_material.as_deref())?;
                params = params.tls(TlsOptions::new(mode)?);
                let id = VaultSecretId::new(secret_path, secret_key_field)?;
                let source = HashicorpVaultSource::new(params.build()?, token_source)?;
                Ok(Box::new(SourcedKey::new(source, id)))
            }
            Self::AzureKeyVault {
                vault_name,
                client_id,
                client_secret_ref,
                tenant_id,
                secret_name,
                timeout_ms,
            } => {
                let id = AzureSecretId::new(vault_name, secret_name)?;
                let mut source = AzureKeyVaultSource::new(
                    tenant_id,
                    client_id,
                    client_secret_ref,
                    timeout_from_ms(timeout_ms)?,
                )?;
                if let Some(endpoints) = &options.azure_endpoints {
                    source = source.with_endpoints(endpoints.clone());
                }
                Ok(Box::new(SourcedKey::new(source, id)))
            }
            Self::Hsm {
                library_path,
                slot,
                key_alias,
                pin_source,
                timeout_ms,
            } => {
                let Some(loader) = &options.hsm_loader else {
                    return Err(ConfigurationError::HsmLoaderMissing { library_path });
                };
                let id = HsmKeyId::new(slot, key_alias)?;
                let module = hsm_modules.handle(&library_path, loader)?;
                let source = HsmSecretSource::with_module(module, pin_source, timeout_from_ms(timeout_ms)?)?;
                Ok(Box::new(SourcedKey::new(source, id)))
            }
        }
    }
}

fn timeout_from_ms(timeout_ms: Option<i64>) -> Result<Option<Timeout>, ConfigurationError> {
    timeout_ms.map(Timeout::from_ms).transpose()
}

/// Parse a TOML document holding a `[[keySource]]` array.
pub fn parse_descriptors(contents: &str) -> Result<Vec<KeySourceDescriptor>, toml::de::Error> {
    toml::from_str::<ConfigFile>(contents).map(|file| file.key_sources)
}

/// Read descriptors from a TOML file or a directory of TOML files.
pub fn load_descriptors(path: &Path) -> Result<Vec<KeySourceDescriptor>, ConfigurationError> {
    if !path.is_dir() {
        let contents = read_to_string(path)?;
        return parse_descriptors(&contents).map_err(|e| unparseable(path, e));
    }

    let entries = std::fs::read_dir(path).map_err(|source| ConfigurationError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigurationError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })?;
        let file = entry.path();
        if file.is_file() && file.extension().is_some_and(|ext| ext == "toml") {
            files.push(file);
        }
    }
    files.sort();

    files
        .iter()
        .map(|file| {
            let contents = read_to_string(file)?;
            toml::from_str::<KeySourceDescriptor>(&contents).map_err(|e| unparseable(file, e))
        })
        .collect()
}

fn read_to_string(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).map_err(|source| ConfigurationError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })
}

fn unparseable(path: &Path, error: toml::de::Error) -> ConfigurationError {
    ConfigurationError::Unparseable {
        path: path.to_path_buf(),
        reason: error.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[keySource]]
        type = "file"
        path = "/etc/signer/key.json"
        encryptionPasswordSource = { env = "SIGNER_KEY_PASSWORD" }

        [[keySource]]
        type = "hashicorp-vault"
        host = "vault.internal"
        tls = { trustMode = "system-ca" }
        timeoutMs = 2500
        secretPath = "secret/data/signer"
        secretKeyField = "privateKey"
        tokenSource = { file = "/run/secrets/vault-token" }

        [[keySource]]
        type = "azure-key-vault"
        vaultName = "signer-vault"
        clientId = "00000000-0000-0000-0000-000000000001"
        clientSecretRef = { env = "AZURE_CLIENT_SECRET" }
        tenantId = "00000000-0000-0000-0000-000000000002"
        secretName = "eth-key"

        [[keySource]]
        type = "hsm"
        libraryPath = "/usr/lib/softhsm/libsofthsm2.so"
        slot = 0
        keyAlias = "eth-signer"
        pinSource = { env = "HSM_PIN" }
    "#;

    #[test]
    fn parses_every_descriptor_kind() {
        let descriptors = parse_descriptors(CONFIG).unwrap();
        assert_eq!(descriptors.len(), 4);
        assert_eq!(
            descriptors[0],
            KeySourceDescriptor::File {
                path: "/etc/signer/key.json".into(),
                encryption_password_source: Some(SecretRef::Env("SIGNER_KEY_PASSWORD".into())),
            }
        );
        match &descriptors[1] {
            KeySourceDescriptor::HashicorpVault { port, tls, timeout_ms, .. } => {
                assert_eq!(*port, None);
                assert_eq!(tls.trust_mode, TrustModeKind::SystemCa);
                assert_eq!(*timeout_ms, Some(2500));
            }
            other => panic!("expected vault descriptor, got {other:?}"),
        }
        assert!(matches!(descriptors[2], KeySourceDescriptor::AzureKeyVault { .. }));
        assert!(matches!(descriptors[3], KeySourceDescriptor::Hsm { slot: 0, .. }));
    }

    #[test]
    fn rejects_plaintext_secret() {
        let config = r#"
            [[keySource]]
            type = "hashicorp-vault"
            host = "vault.internal"
            tls = { trustMode = "system-ca" }
            secretPath = "secret/data/signer"
            secretKeyField = "privateKey"
            tokenSource = "s.plaintexttoken"
        "#;
        assert!(parse_descriptors(config).is_err());
    }

    #[test]
    fn vault_without_tls_is_rejected() {
        let config = r#"
            [[keySource]]
            type = "hashicorp-vault"
            host = "vault.internal"
            secretPath = "secret/data/signer"
            secretKeyField = "privateKey"
            tokenSource = { env = "VAULT_TOKEN" }
        "#;
        let err = parse_descriptors(config).unwrap_err();
        assert!(err.message().contains("tls"), "{}", err.message());
    }

    #[test]
    fn known_server_without_fingerprint_is_rejected() {
        let descriptor = KeySourceDescriptor::HashicorpVault {
            host: "vault.internal".into(),
            port: None,
            tls: TlsDescriptor {
                trust_mode: TrustModeKind::KnownServer,
                trust_material: None,
            },
            timeout_ms: None,
            secret_path: "secret/data/signer".into(),
            secret_key_field: "privateKey".into(),
            token_source: SecretRef::Env("PATH".into()),
        };
        let result = descriptor.into_key_source(&LoadOptions::default(), &HsmModules::default());
        assert!(matches!(result, Err(ConfigurationError::MissingTrustMaterial { .. })));
    }

    #[test]
    fn rejects_unknown_type() {
        let config = "[[keySource]]\ntype = \"gcp-secret-manager\"\n";
        assert!(parse_descriptors(config).is_err());
    }

    #[test]
    fn empty_document_has_no_sources() {
        assert!(parse_descriptors("").unwrap().is_empty());
    }

    #[test]
    fn invalid_port_fails_before_connecting() {
        let descriptor = KeySourceDescriptor::HashicorpVault {
            host: "vault.internal".into(),
            port: Some(0),
            tls: TlsDescriptor {
                trust_mode: TrustModeKind::SystemCa,
                trust_material: None,
            },
            timeout_ms: None,
            secret_path: "secret/data/signer".into(),
            secret_key_field: "privateKey".into(),
            token_source: SecretRef::Env("PATH".into()),
        };
        let result = descriptor.into_key_source(&LoadOptions::default(), &HsmModules::default());
        assert!(matches!(result, Err(ConfigurationError::InvalidPort(0))));
    }

    #[test]
    fn hsm_without_loader_is_rejected() {
        let descriptor = KeySourceDescriptor::Hsm {
            library_path: "/usr/lib/softhsm/libsofthsm2.so".into(),
            slot: 0,
            key_alias: "eth-signer".into(),
            pin_source: SecretRef::Env("PATH".into()),
            timeout_ms: None,
        };
        let result = descriptor.into_key_source(&LoadOptions::default(), &HsmModules::default());
        assert!(matches!(result, Err(ConfigurationError::HsmLoaderMissing { .. })));
    }

    #[test]
    fn negative_azure_timeout_is_rejected() {
        assert!(matches!(
            timeout_from_ms(Some(-5)),
            Err(ConfigurationError::NegativeTimeout(-5))
        ));
        assert_eq!(timeout_from_ms(None).unwrap(), None);
        assert_eq!(timeout_from_ms(Some(0)).unwrap(), Some(Timeout::Unbounded));
    }

    #[test]
    fn directory_entries_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-second.toml"), "type = \"file\"\npath = \"/keys/b\"\n").unwrap();
        std::fs::write(dir.path().join("10-first.toml"), "type = \"file\"\npath = \"/keys/a\"\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a descriptor").unwrap();

        let descriptors = load_descriptors(dir.path()).unwrap();
        let paths: Vec<_> = descriptors
            .iter()
            .map(|descriptor| match descriptor {
                KeySourceDescriptor::File { path, .. } => path.clone(),
                other => panic!("unexpected descriptor {other:?}"),
            })
            .collect();
        assert_eq!(paths, vec![PathBuf::from("/keys/a"), PathBuf::from("/keys/b")]);
    }

    #[test]
    fn unparseable_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");
        std::fs::write(&path, "[[keySource]]\ntype = ").unwrap();
        match load_descriptors(&path) {
            Err(ConfigurationError::Unparseable { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected unparseable error, got {other:?}"),
        }
    }
}
