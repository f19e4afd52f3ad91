//! Passive Authentication (PA).
//!
//! Verifies the Document Security Object (EF.SOD) against a trust store of
//! Country Signing CA (CSCA) certificates and exposes the authenticated data
//! group hash table, so each elementary file read from the chip can be
//! checked for integrity. Follows ICAO Doc 9303-10 Section 4.6.2 and
//! RFC 5652 (CMS)
//! <https://www.icao.int/publications/Documents/9303_p10_cons_en.pdf>
//!
//! Certificate revocation lists are not consulted. CRLs embedded in the
//! EF.SOD or Master List are rejected or ignored per Doc 9303, and online
//! revocation checking needs a PKD connection this crate does not have.

use alloc::{format, string::String, vec::Vec};
use constant_time_eq::constant_time_eq;
use openssl::asn1::Asn1Time;
use openssl::hash::{hash, MessageDigest};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509StoreContext, X509};
use rasn::{der, prelude::Oid};
use rasn_cms::{CertificateChoices, SignedData};
use tracing::{error, info, warn};

use crate::iso7816::{get_asn1_child, validate_asn1_tag};
use crate::AuthError;

/// ASN.1 definitions from ICAO Doc 9303-10 Appendix D.2.
///
/// ```asn
/// LDSSecurityObject ::= SEQUENCE {
///   version LDSSecurityObjectVersion,
///   hashAlgorithm DigestAlgorithmIdentifier,
///   dataGroupHashValues SEQUENCE SIZE (2..ub-DataGroups) OF DataGroupHash,
///   ldsVersionInfo LDSVersionInfo OPTIONAL
///   -- If present, version MUST be V1
/// }
///
/// DataGroupHash ::= SEQUENCE {
///   dataGroupNumber DataGroupNumber,
///   dataGroupHashValue OCTET STRING }
/// ```
pub(crate) mod lds_security_object {
    extern crate alloc;
    use rasn::prelude::*;
    use rasn_cms::AlgorithmIdentifier;

    pub type DataGroupNumber = Integer;
    pub type DigestAlgorithmIdentifier = AlgorithmIdentifier;
    pub type LDSSecurityObjectVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct DataGroupHash {
        pub data_group_number: DataGroupNumber,
        pub data_group_hash_value: OctetString,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LDSSecurityObject {
        pub version: LDSSecurityObjectVersion,
        pub hash_algorithm: DigestAlgorithmIdentifier,
        #[rasn(size("2..=16"))]
        pub data_group_hash_values: SequenceOf<DataGroupHash>,
        pub lds_version_info: Option<LDSVersionInfo>,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LDSVersionInfo {
        pub lds_version: PrintableString,
        pub unicode_version: PrintableString,
    }
}

/// ASN.1 definitions from ICAO Doc 9303-12 Section 9.
///
/// ```asn
/// CscaMasterList ::= SEQUENCE {
///   version CscaMasterListVersion,
///   certList SET OF Certificate }
/// ```
pub(crate) mod csca_master_list {
    extern crate alloc;
    use rasn::prelude::*;
    use rasn_pkix::Certificate;

    pub type CscaMasterListCertList = SetOf<Certificate>;
    pub type CscaMasterListVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct CscaMasterList {
        pub version: CscaMasterListVersion,
        pub cert_list: CscaMasterListCertList,
    }
}

/// The CSCA certificates trusted as roots for Document Signer Certificate
/// (DSC) path validation.
pub struct TrustAnchorSet {
    store: X509Store,
}

impl TrustAnchorSet {
    /// Builds the trust anchors from a CSCA Master List as distributed
    /// through the ICAO PKD, an CMS structure specified in
    /// ICAO Doc 9303-12 Section 9
    /// <https://www.icao.int/publications/Documents/9303_p12_cons_en.pdf>
    ///
    /// The Master List Signer signature is verified against the CSCA
    /// certificate carried next to it when one is present. A missing CSCA
    /// companion only produces a warning, the list itself is still used.
    ///
    /// # Errors
    ///
    /// * `AuthError::TrustStoreError` if the Master List structure is invalid.
    /// * `AuthError::SignatureVerificationError` if the signer signature fails.
    pub fn from_master_list(master_list: &[u8]) -> Result<Self, AuthError> {
        let content_info = der::decode::<rasn_cms::ContentInfo>(master_list)
            .map_err(AuthError::RasnDecodeError)?;
        if content_info
            .content_type
            .ne(Oid::const_new(&[1, 2, 840, 113549, 1, 7, 2]))
        {
            error!("Master List ContentInfo contentType OID must be id-signedData");
            return Err(AuthError::TrustStoreError(
                "Master List ContentInfo contentType OID must be id-signedData",
            ));
        }

        let signed_data = der::decode::<SignedData>(content_info.content.as_bytes())
            .map_err(AuthError::RasnDecodeError)?;

        // ICAO Doc 9303-12 Section 9, always V3 for Master Lists
        if signed_data.version.ne(&rasn::types::Integer::from(3)) {
            error!("Master List SignedData version must be V3");
            return Err(AuthError::TrustStoreError(
                "Master List SignedData version must be V3",
            ));
        }
        if signed_data.digest_algorithms.is_empty() {
            error!("Master List SignedData digestAlgorithms can not be empty");
            return Err(AuthError::TrustStoreError(
                "Master List SignedData digestAlgorithms can not be empty",
            ));
        }

        // id-icao-cscaMasterList
        if signed_data
            .encap_content_info
            .content_type
            .ne(Oid::const_new(&[2, 23, 136, 1, 1, 2]))
        {
            error!("Master List SignedData encapContentInfo OID must be id-icao-cscaMasterList");
            return Err(AuthError::TrustStoreError(
                "Master List SignedData encapContentInfo OID must be id-icao-cscaMasterList",
            ));
        }
        let Some(ref csca_master_list_bytes) = signed_data.encap_content_info.content else {
            error!("Master List SignedData must contain eContent CscaMasterList");
            return Err(AuthError::TrustStoreError(
                "Master List SignedData must contain eContent CscaMasterList",
            ));
        };

        // ICAO Doc 9303-12 Section 7.1.1.3, the Master List Signer carries
        // extendedKeyUsage 2.23.136.1.1.3, the CSCA companion carries
        // basicConstraints cA with pathLenConstraint 0
        let mut master_list_signer = None;
        let mut companion_csca = None;
        for cert in signed_data.certificates.iter().flatten() {
            let CertificateChoices::Certificate(c) = cert else {
                continue;
            };
            let Some(exts) = &c.tbs_certificate.extensions else {
                error!("Certificates in a Master List must carry Extensions");
                return Err(AuthError::TrustStoreError(
                    "Certificates in a Master List must carry Extensions",
                ));
            };
            for ext in exts.iter() {
                if ext.extn_id.eq(Oid::const_new(&[2, 5, 29, 37]))
                    && ext.extn_value.len() == 10
                    && constant_time_eq(
                        &ext.extn_value,
                        b"\x30\x08\x06\x06\x67\x81\x08\x01\x01\x03",
                    )
                {
                    let der = der::encode(&c).map_err(AuthError::RasnEncodeError)?;
                    master_list_signer = Some(X509::from_der(&der)?);
                    break;
                } else if ext.extn_id.eq(Oid::const_new(&[2, 5, 29, 19]))
                    && ext.extn_value.len() == 8
                    && constant_time_eq(&ext.extn_value, b"\x30\x06\x01\x01\xFF\x02\x01\x00")
                {
                    let der = der::encode(&c).map_err(AuthError::RasnEncodeError)?;
                    companion_csca = Some(X509::from_der(&der)?);
                    break;
                }
            }
        }
        let Some(master_list_signer) = master_list_signer else {
            error!("Master List must include a Master List Signer certificate");
            return Err(AuthError::TrustStoreError(
                "Master List must include a Master List Signer certificate",
            ));
        };
        match companion_csca {
            Some(csca) => {
                let mut store_bldr = X509StoreBuilder::new()?;
                store_bldr.add_cert(csca)?;
                let store = store_bldr.build();
                let (verified, reason) = verify_cert_path(&store, &master_list_signer)?;
                if !verified {
                    warn!("Error while verifying Master List Signer Certificate signature: {reason}");
                }
                info!("Master List Signer Certificate signature verification result: {verified}");
            }
            None => {
                warn!("Master List Signer Certificate signature is not verified, no CSCA certificate found in the Master List");
            }
        }

        // CRLs should not be present, ICAO Doc 9303-12 Section 9
        if signed_data.crls.is_some() {
            error!("Master List must not contain a CRL");
            return Err(AuthError::TrustStoreError(
                "Master List must not contain a CRL",
            ));
        }

        verify_cms_signature(
            &signed_data,
            Oid::const_new(&[2, 23, 136, 1, 1, 2]),
            csca_master_list_bytes,
            &master_list_signer,
        )?;

        // Parse the eContent and collect the CSCA certificates
        let csca_master_list =
            der::decode::<csca_master_list::CscaMasterList>(csca_master_list_bytes)
                .map_err(AuthError::RasnDecodeError)?;
        if csca_master_list
            .version
            .ne(&rasn::types::Integer::from(0))
        {
            error!("Master List CscaMasterListVersion must be V0");
            return Err(AuthError::TrustStoreError(
                "Master List CscaMasterListVersion must be V0",
            ));
        }

        let mut store_bldr = X509StoreBuilder::new()?;
        for csca_cert in csca_master_list.cert_list {
            let der = der::encode(&csca_cert).map_err(AuthError::RasnEncodeError)?;
            store_bldr.add_cert(X509::from_der(&der)?)?;
        }
        Ok(Self {
            store: store_bldr.build(),
        })
    }

    /// Builds the trust anchors from raw DER-encoded CSCA certificates,
    /// for callers that maintain their own certificate collection.
    ///
    /// # Errors
    ///
    /// * `AuthError::OpensslErrorStack` if a certificate can not be parsed.
    pub fn from_certificates<C: AsRef<[u8]>>(certificates: &[C]) -> Result<Self, AuthError> {
        let mut store_bldr = X509StoreBuilder::new()?;
        for cert in certificates {
            store_bldr.add_cert(X509::from_der(cert.as_ref())?)?;
        }
        Ok(Self {
            store: store_bldr.build(),
        })
    }

    /// Number of trusted CSCA certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.all_certificates().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The authenticated data group hashes out of a verified EF.SOD.
pub struct DataGroupHashTable {
    digest: MessageDigest,
    hashes: Vec<lds_security_object::DataGroupHash>,
}

// `MessageDigest` does not implement `Debug`, print its NID name instead
impl core::fmt::Debug for DataGroupHashTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataGroupHashTable")
            .field("digest", &self.digest.type_().long_name().unwrap_or("unknown"))
            .field("hashes", &self.hashes)
            .finish()
    }
}

impl DataGroupHashTable {
    /// Whether the security object covers the given data group.
    #[must_use]
    pub fn contains(&self, dg_number: u8) -> bool {
        self.hashes
            .iter()
            .any(|h| h.data_group_number.eq(&rasn::types::Integer::from(dg_number)))
    }

    /// Checks a data group read from the chip against the authenticated hash.
    ///
    /// # Errors
    ///
    /// * `AuthError::HashMismatchError` if the hash differs or the data group
    ///   is not covered by the security object.
    /// * `AuthError::InvalidArgument` if `dg_number` is outside `1..=16`.
    pub fn verify(&self, dg_number: u8, dg: &[u8]) -> Result<(), AuthError> {
        if !(1..=16).contains(&dg_number) {
            error!("Invalid Data Group number: {dg_number}");
            return Err(AuthError::InvalidArgument("Invalid Data Group number"));
        }

        let hash_bytes = hash(self.digest, dg)?;
        let mut verified_hash = None;
        for dg_hash in &self.hashes {
            if dg_hash
                .data_group_number
                .eq(&rasn::types::Integer::from(dg_number))
            {
                verified_hash = Some(&dg_hash.data_group_hash_value);
            }
        }
        match verified_hash {
            Some(verified_hash) => {
                if !constant_time_eq(verified_hash, &hash_bytes) {
                    error!("Potentially cloned document, hashes do not match");
                    return Err(AuthError::HashMismatchError(format!(
                        "EF.DG{dg_number} hash does not match the Document Security Object"
                    )));
                }
                Ok(())
            }
            None => {
                error!("EF.DG{dg_number} file hash is not found inside the verified hashes");
                Err(AuthError::HashMismatchError(format!(
                    "EF.DG{dg_number} file hash is not found inside the verified hashes"
                )))
            }
        }
    }
}

/// Performs Passive Authentication on the EF.SOD.
///
/// Validates the CMS structure, builds the certification path from the
/// Document Signer Certificate to a trusted CSCA, verifies the signature
/// over the LDSSecurityObject and returns the authenticated data group hash
/// table together with the DSC.
///
/// # Errors
///
/// * `AuthError::InvalidFileStructure` if the EF.SOD structure is invalid.
/// * `AuthError::CertPathValidationError` if no path to a trust anchor exists
///   or the DSC is outside its validity window.
/// * `AuthError::SignatureVerificationError` if the signature is wrong.
pub fn passive_authentication(
    ef_sod: &[u8],
    anchors: &TrustAnchorSet,
) -> Result<(DataGroupHashTable, X509), AuthError> {
    // ICAO Doc 9303-10 Section 4.6.2, strip the Document Security Object
    // tag 0x77
    validate_asn1_tag(ef_sod, b"\x77")?;
    let (ef_sod_rem, trailing) = get_asn1_child(ef_sod, 1)?;
    if !trailing.is_empty() {
        error!("EF.SOD must contain nothing after the '0x77' template");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD must contain nothing after the '0x77' template",
        ));
    }

    let content_info =
        der::decode::<rasn_cms::ContentInfo>(ef_sod_rem).map_err(AuthError::RasnDecodeError)?;
    if content_info
        .content_type
        .ne(Oid::const_new(&[1, 2, 840, 113549, 1, 7, 2]))
    {
        error!("EF.SOD ContentInfo contentType OID must be id-signedData");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD ContentInfo contentType OID must be id-signedData",
        ));
    }

    let signed_data = der::decode::<SignedData>(content_info.content.as_bytes())
        .map_err(AuthError::RasnDecodeError)?;

    // ICAO Doc 9303-10 Section 4.6.2.2, always V3 for eMRTDs
    if signed_data.version.ne(&rasn::types::Integer::from(3)) {
        error!("EF.SOD SignedData version must be V3");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD SignedData version must be V3",
        ));
    }
    if signed_data.digest_algorithms.is_empty() {
        error!("EF.SOD SignedData digestAlgorithms can not be empty");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD SignedData digestAlgorithms can not be empty",
        ));
    }

    // id-icao-mrtd-security-ldsSecurityObject
    if signed_data
        .encap_content_info
        .content_type
        .ne(Oid::const_new(&[2, 23, 136, 1, 1, 1]))
    {
        error!("EF.SOD SignedData encapContentInfo OID must be id-icao-mrtd-security-ldsSecurityObject");
        return Err(AuthError::InvalidFileStructure("EF.SOD SignedData encapContentInfo OID must be id-icao-mrtd-security-ldsSecurityObject"));
    }
    let Some(ref lds_security_object_bytes) = signed_data.encap_content_info.content else {
        error!("EF.SOD SignedData must contain eContent LDSSecurityObject");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD SignedData must contain eContent LDSSecurityObject",
        ));
    };

    // ICAO Doc 9303-10 Section 4.6.2.2
    // > States are REQUIRED to include the Document Signer Certificate (CDS)
    // > which can be used to verify the signature in the signerInfos field.
    let dsc = {
        let mut possible_dsc = None;
        for cert in signed_data.certificates.iter().flatten() {
            if let CertificateChoices::Certificate(c) = cert {
                let dsc_bytes = der::encode(&c).map_err(AuthError::RasnEncodeError)?;
                possible_dsc = Some(X509::from_der(&dsc_bytes)?);
                break;
            }
        }
        let Some(dsc) = possible_dsc else {
            error!("EF.SOD must include a Document Signer Certificate");
            return Err(AuthError::InvalidFileStructure(
                "EF.SOD must include a Document Signer Certificate",
            ));
        };
        let (verified, reason) = verify_cert_path(&anchors.store, &dsc)?;
        if !verified {
            error!("Error while verifying Document Signer Certificate signature: {reason}");
            return Err(AuthError::CertPathValidationError(reason));
        }
        info!("Document Signer Certificate signature verification result: {verified}");
        dsc
    };

    // The DSC must be inside its validity window right now
    let now = Asn1Time::days_from_now(0)?;
    if dsc.not_before() > &now || dsc.not_after() < &now {
        error!("Document Signer Certificate is outside its validity window");
        return Err(AuthError::CertPathValidationError(
            "Document Signer Certificate is outside its validity window".into(),
        ));
    }

    // CRLs are recommended against by ICAO Doc 9303-10 Section 4.6.2.2 and
    // ignored here, revocation is not checked
    if signed_data.crls.is_some() {
        warn!("EF.SOD carries CRLs, ignoring them");
    }

    verify_cms_signature(
        &signed_data,
        Oid::const_new(&[2, 23, 136, 1, 1, 1]),
        lds_security_object_bytes,
        &dsc,
    )?;

    // Parse the eContent
    let lds_security_object =
        der::decode::<lds_security_object::LDSSecurityObject>(lds_security_object_bytes)
            .map_err(AuthError::RasnDecodeError)?;
    // LDSSecurityObject has two versions, defined by ICAO Doc 9303-10
    if lds_security_object
        .version
        .eq(&rasn::types::Integer::from(0))
    {
        if lds_security_object.lds_version_info.is_some() {
            error!("EF.SOD LDSSecurityObjectVersion is V0, but ldsVersionInfo is present");
            return Err(AuthError::InvalidFileStructure(
                "EF.SOD LDSSecurityObjectVersion is V0, but ldsVersionInfo is present",
            ));
        }
        info!("LDSSecurityObjectVersion is V0");
    } else if lds_security_object
        .version
        .eq(&rasn::types::Integer::from(1))
    {
        if lds_security_object.lds_version_info.is_none() {
            error!("EF.SOD LDSSecurityObjectVersion is V1, but ldsVersionInfo is not present");
            return Err(AuthError::InvalidFileStructure(
                "EF.SOD LDSSecurityObjectVersion is V1, but ldsVersionInfo is not present",
            ));
        }
        info!("LDSSecurityObjectVersion is V1");
    }

    // Skip algorithm parameters
    let file_digest_algorithm = oid2digestalg(&lds_security_object.hash_algorithm.algorithm)?;
    if lds_security_object.data_group_hash_values.len() < 2
        || lds_security_object.data_group_hash_values.len() > 16
    {
        error!("EF.SOD LDSSecurityObject DataGroupHash values are invalid");
        return Err(AuthError::InvalidFileStructure(
            "EF.SOD LDSSecurityObject DataGroupHash values are invalid",
        ));
    }
    for data_group_hash in &lds_security_object.data_group_hash_values {
        if data_group_hash
            .data_group_number
            .gt(&rasn::types::Integer::from(16))
        {
            error!("EF.SOD LDSSecurityObject invalid DataGroupHash number");
            return Err(AuthError::InvalidFileStructure(
                "EF.SOD LDSSecurityObject invalid DataGroupHash number",
            ));
        }
    }

    Ok((
        DataGroupHashTable {
            digest: file_digest_algorithm,
            hashes: lds_security_object.data_group_hash_values,
        },
        dsc,
    ))
}

/// Builds and checks the certification path from `cert` to the store.
fn verify_cert_path(store: &X509Store, cert: &X509) -> Result<(bool, String), AuthError> {
    let chain = Stack::new()?;
    let mut context = X509StoreContext::new()?;
    let result = context.init(store, cert, &chain, |c| {
        let verification = c.verify_cert()?;
        if verification {
            Ok((verification, String::new()))
        } else {
            Ok((verification, c.error().error_string().to_owned()))
        }
    })?;
    Ok(result)
}

/// Verifies the single SignerInfo of a CMS SignedData against the given
/// signer certificate, per the RFC 5652 Section 5.6 signature verification
/// process. The eContent digest is checked against the messageDigest signed
/// attribute, then the signature over the re-tagged signedAttrs.
fn verify_cms_signature(
    signed_data: &SignedData,
    econtent_type: &'static Oid,
    econtent: &[u8],
    signer: &X509,
) -> Result<(), AuthError> {
    if signed_data.signer_infos.is_empty() {
        error!("SignedData signerInfos can't be empty");
        return Err(AuthError::InvalidFileStructure(
            "SignedData signerInfos can't be empty",
        ));
    }
    if signed_data.signer_infos.len() > 1 {
        error!("SignedData with more than one SignerInfo is not supported");
        return Err(AuthError::InvalidFileStructure(
            "SignedData with more than one SignerInfo is not supported",
        ));
    }
    let signer_info = signed_data
        .signer_infos
        .first()
        .expect("len of SignerInfos is 1");

    // RFC 5652 Section 5.3, the version is tied to the SignerIdentifier
    // CHOICE
    match signer_info.sid {
        rasn_cms::SignerIdentifier::IssuerAndSerialNumber(_) => {
            if signer_info.version.ne(&rasn::types::Integer::from(1)) {
                error!("SignedData signerInfo IssuerAndSerialNumber is provided but version is not 1");
                return Err(AuthError::InvalidFileStructure(
                    "SignedData signerInfo IssuerAndSerialNumber is provided but version is not 1",
                ));
            }
        }
        rasn_cms::SignerIdentifier::SubjectKeyIdentifier(_) => {
            if signer_info.version.ne(&rasn::types::Integer::from(3)) {
                error!("SignedData signerInfo SubjectKeyIdentifier is provided but version is not 3");
                return Err(AuthError::InvalidFileStructure(
                    "SignedData signerInfo SubjectKeyIdentifier is provided but version is not 3",
                ));
            }
        }
    };

    // RFC 5652 Section 5.3
    // > The message digest algorithm SHOULD be among those
    // > listed in the digestAlgorithms field of the associated SignerData.
    if !signed_data
        .digest_algorithms
        .contains(&signer_info.digest_algorithm)
    {
        error!("SignedData signerInfo DigestAlgorithm must be included in SignedData digestAlgorithms set");
        return Err(AuthError::InvalidFileStructure(
            "SignedData signerInfo DigestAlgorithm must be included in SignedData digestAlgorithms set",
        ));
    }
    // Ignore digest_algorithm parameters
    let digest_algorithm = oid2digestalg(&signer_info.digest_algorithm.algorithm)?;

    // signedAttrs is mandatory since the eContent type is not id-data,
    // RFC 5652 Section 5.3
    let signed_attrs = match &signer_info.signed_attrs {
        None => {
            error!("SignedData signerInfo signed_attrs can't be empty");
            return Err(AuthError::InvalidFileStructure(
                "SignedData signerInfo signed_attrs can't be empty",
            ));
        }
        Some(signed_attrs) => signed_attrs,
    };

    // RFC 5652 Sections 11.1 and 11.2, the content-type (1.2.840.113549.1.9.3)
    // and message-digest (1.2.840.113549.1.9.4) attributes must be present
    let mut content_type = None;
    let mut message_digest = None;
    for signed_attr in signed_attrs {
        if signed_attr
            .r#type
            .eq(Oid::const_new(&[1, 2, 840, 113549, 1, 9, 3]))
        {
            if signed_attr.values.len() != 1 {
                error!("SignedData signerInfo signed_attrs contentType attribute values must have a single item");
                return Err(AuthError::InvalidFileStructure(
                    "SignedData signerInfo signed_attrs contentType attribute values must have a single item",
                ));
            }
            let temp = signed_attr
                .values
                .first()
                .expect("There is only one item")
                .as_bytes();
            content_type = Some(
                der::decode::<rasn::types::ObjectIdentifier>(temp)
                    .map_err(AuthError::RasnDecodeError)?,
            );
        } else if signed_attr
            .r#type
            .eq(Oid::const_new(&[1, 2, 840, 113549, 1, 9, 4]))
        {
            if signed_attr.values.len() != 1 {
                error!("SignedData signerInfo signed_attrs messageDigest attribute values must have a single item");
                return Err(AuthError::InvalidFileStructure(
                    "SignedData signerInfo signed_attrs messageDigest attribute values must have a single item",
                ));
            }
            let temp = signed_attr
                .values
                .first()
                .expect("There is only one item")
                .as_bytes();
            message_digest = Some(
                der::decode::<rasn::types::OctetString>(temp)
                    .map_err(AuthError::RasnDecodeError)?,
            );
        }
    }
    let (Some(content_type), Some(message_digest)) = (content_type, message_digest) else {
        error!("SignedData signerInfo signed_attrs contentType or messageDigest values do not exist");
        return Err(AuthError::InvalidFileStructure(
            "SignedData signerInfo signed_attrs contentType or messageDigest values do not exist",
        ));
    };

    // The contentType attribute must name the eContent type being signed
    if content_type.ne(econtent_type) {
        error!("SignedData signerInfo signed_attrs contentType does not match the eContent type");
        return Err(AuthError::InvalidFileStructure(
            "SignedData signerInfo signed_attrs contentType does not match the eContent type",
        ));
    }

    // RFC 5652 Section 5.4, message digest calculation process
    let econtent_hash = hash(digest_algorithm, econtent)?;
    if econtent_hash.ne(&message_digest) {
        error!("Digest of the eContent does not match with the digest in SignedAttributes");
        return Err(AuthError::SignatureVerificationError(
            "Digest of the eContent does not match with the digest in SignedAttributes",
        ));
    }
    info!("Digest of the eContent matches with the digest in SignedAttributes");

    // Ignore unsignedAttrs
    _ = signer_info.unsigned_attrs;

    // RFC 5652 Section 5.4
    // > A separate encoding of the signedAttrs field is performed for
    // > message digest calculation. The IMPLICIT [0] tag in the signedAttrs
    // > is not used for the DER encoding, rather an EXPLICIT SET OF tag is
    // > used.
    let mut signed_attrs_bytes = der::encode(&signed_attrs).map_err(AuthError::RasnEncodeError)?;
    signed_attrs_bytes[0] = b'\x31';

    // RFC 5652 Section 5.6, signature verification process
    let signature = &signer_info.signature;
    let pub_key = signer.public_key()?;
    let mut verifier = Verifier::new(digest_algorithm, &pub_key)?;
    // RSASSA-PSS parameters are not decoded, the MGF1 digest and salt
    // length are fixed to the signerInfo digest algorithm as Doc 9303
    // profiles them
    if signer_info
        .signature_algorithm
        .algorithm
        .eq(Oid::const_new(&[1, 2, 840, 113549, 1, 1, 10]))
    {
        verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
        verifier.set_rsa_mgf1_md(digest_algorithm)?;
        verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    }
    verifier.update(&signed_attrs_bytes)?;
    let sig_verified = verifier.verify(signature)?;
    info!("Signature verification: {sig_verified}");

    if !sig_verified {
        error!("CMS signature verification failure");
        return Err(AuthError::SignatureVerificationError(
            "CMS signature verification failure",
        ));
    }
    Ok(())
}

/// Maps a digest algorithm OID to the openssl message digest.
///
/// # Errors
///
/// * `AuthError::InvalidOidError` if the OID is not a known digest algorithm.
fn oid2digestalg(oid: &rasn::types::ObjectIdentifier) -> Result<MessageDigest, AuthError> {
    let digest_alg_oid_dict: [(&Oid, MessageDigest); 5] = [
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 4]),
            MessageDigest::sha224(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 3]),
            MessageDigest::sha512(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 2]),
            MessageDigest::sha384(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]),
            MessageDigest::sha256(),
        ),
        (Oid::const_new(&[1, 3, 14, 3, 2, 26]), MessageDigest::sha1()),
    ];
    for (digest_oid, digest) in digest_alg_oid_dict {
        if oid.eq(digest_oid) {
            return Ok(digest);
        }
    }
    error!("Invalid OID while finding a digest algorithm");
    Err(AuthError::InvalidOidError())
}
