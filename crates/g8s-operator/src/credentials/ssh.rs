use snafu::{ResultExt, ensure};
use ssh_key::{
    Algorithm, LineEnding, PrivateKey,
    private::{KeypairData, RsaKeypair},
};

use super::{
    Credential, EncodeSshKeySnafu, GenerateSshKeySnafu, Generation, Result, RsaKeyTooSmallSnafu,
};
use crate::crd::{ResourceKind, SshKeyPair, SshKeyType};

const DEFAULT_RSA_BIT_SIZE: u32 = 4096;
const MIN_RSA_BIT_SIZE: u32 = 2048;

impl Credential for SshKeyPair {
    const BACKEND_SECRET_TYPE: &'static str = "kubernetes.io/ssh-auth";
    const FIELDS: &'static [&'static str] = &["ssh.pub", "ssh.key"];
    const KIND: ResourceKind = ResourceKind::SshKeyPair;

    fn generate(&self) -> Result<Generation> {
        let key_type = self.spec.key_type;
        let mut rng = rand_core::OsRng;

        let private_key = match key_type {
            SshKeyType::Ed25519 => PrivateKey::random(&mut rng, Algorithm::Ed25519)
                .context(GenerateSshKeySnafu { key_type })?,
            SshKeyType::Rsa => {
                let bit_size = self.spec.bit_size.unwrap_or(DEFAULT_RSA_BIT_SIZE);
                ensure!(bit_size >= MIN_RSA_BIT_SIZE, RsaKeyTooSmallSnafu { bit_size });

                let keypair = RsaKeypair::random(&mut rng, bit_size as usize)
                    .context(GenerateSshKeySnafu { key_type })?;
                PrivateKey::new(KeypairData::from(keypair), "")
                    .context(GenerateSshKeySnafu { key_type })?
            }
        };

        let private_pem = private_key
            .to_openssh(LineEnding::LF)
            .context(EncodeSshKeySnafu)?;
        let public_key = private_key
            .public_key()
            .to_openssh()
            .context(EncodeSshKeySnafu)?;

        Ok(Generation::from([
            ("ssh.pub".to_owned(), format!("{public_key}\n")),
            ("ssh.key".to_owned(), private_pem.as_str().to_owned()),
        ]))
    }
}
