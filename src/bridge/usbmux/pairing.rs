// Jackson Coxson
//! Pair records: generation, storage format and TLS material

use log::warn;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{HasPublic, PKey, PKeyRef, Private},
    rsa::Rsa,
    x509::{extension::BasicConstraints, X509NameBuilder, X509},
};
use plist::Data;
use serde::{Deserialize, Serialize};

use crate::{message::Message, DeviceError};

const CERT_VALIDITY_DAYS: u32 = 365 * 10;

/// A pair record as usbmuxd stores it. Certificates and keys are PEM.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct PairRecord {
    pub device_certificate: Data,
    pub host_private_key: Data,
    pub host_certificate: Data,
    pub root_private_key: Data,
    pub root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    pub system_buid: String,
    #[serde(rename = "HostID")]
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress", default)]
    pub wifi_mac_address: String,
}

fn make_cert<T: HasPublic>(
    subject: &PKeyRef<T>,
    signer: &PKeyRef<Private>,
    common_name: Option<&str>,
    ca: bool,
) -> Result<X509, DeviceError> {
    let mut name = X509NameBuilder::new()?;
    if let Some(cn) = common_name {
        name.append_entry_by_text("CN", cn)?;
    }
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(subject)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    let mut constraints = BasicConstraints::new();
    if ca {
        constraints.ca();
    }
    builder.append_extension(constraints.critical().build()?)?;
    builder.sign(signer, MessageDigest::sha256())?;
    Ok(builder.build())
}

impl PairRecord {
    /// Creates root, host and device certificates for a new pairing
    ///
    /// # Arguments
    /// * `device_public_key` - PKCS#1 PEM reported by lockdown as `DevicePublicKey`
    pub fn generate(
        device_public_key: &[u8],
        host_id: String,
        system_buid: String,
        wifi_mac_address: String,
    ) -> Result<Self, DeviceError> {
        let device_key = PKey::from_rsa(Rsa::public_key_from_pem_pkcs1(device_public_key)?)?;
        let root_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let host_key = PKey::from_rsa(Rsa::generate(2048)?)?;

        let root_cert = make_cert(&*root_key, &root_key, None, true)?;
        let host_cert = make_cert(&*host_key, &root_key, None, false)?;
        let device_cert = make_cert(&*device_key, &root_key, Some("Device"), false)?;

        Ok(Self {
            device_certificate: device_cert.to_pem()?.into(),
            host_private_key: host_key.private_key_to_pem_pkcs8()?.into(),
            host_certificate: host_cert.to_pem()?.into(),
            root_private_key: root_key.private_key_to_pem_pkcs8()?.into(),
            root_certificate: root_cert.to_pem()?.into(),
            system_buid,
            host_id,
            escrow_bag: None,
            wifi_mac_address,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        match plist::from_bytes::<PairRecord>(bytes) {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!("Unable to parse pair record: {e:?}");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, self)?;
        Ok(buf)
    }

    pub fn host_certificate(&self) -> Result<X509, DeviceError> {
        Ok(X509::from_pem(self.host_certificate.as_ref())?)
    }

    pub fn host_private_key(&self) -> Result<PKey<Private>, DeviceError> {
        Ok(PKey::private_key_from_pem(self.host_private_key.as_ref())?)
    }

    /// The public half sent to lockdown in `Pair` and `ValidatePair`
    pub fn to_request(&self, device_public_key: Option<&[u8]>) -> Message {
        let mut entries = vec![
            (
                "DeviceCertificate",
                Message::Data(self.device_certificate.clone().into()),
            ),
            (
                "HostCertificate",
                Message::Data(self.host_certificate.clone().into()),
            ),
            ("HostID", self.host_id.clone().into()),
            (
                "RootCertificate",
                Message::Data(self.root_certificate.clone().into()),
            ),
            ("SystemBUID", self.system_buid.clone().into()),
            ("WiFiMACAddress", self.wifi_mac_address.clone().into()),
        ];
        if let Some(key) = device_public_key {
            entries.insert(0, ("DevicePublicKey", Message::Data(key.to_vec())));
        }
        Message::dictionary(entries)
    }
}
