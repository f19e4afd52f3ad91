//! MRZ-derived access key for BAC and PACE.

use alloc::{borrow::ToOwned, collections::BTreeMap, format, string::String};
use tracing::error;

use crate::AuthError;

/// The MRZ fields that seed the document access keys.
///
/// Validation happens on construction; a successfully built `MrzKey` always
/// produces a well-formed key seed string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrzKey {
    doc_no: String,
    birthdate: String,
    expirydate: String,
}

impl MrzKey {
    /// Builds an `MrzKey` from the second line of the MRZ.
    ///
    /// Document numbers can be up to 22 characters (TD1 size, see ICAO
    /// Doc 9303-5 Section 4.2.2) and must consist of MRZ characters.
    /// Birth and expiry dates must be exactly six ASCII digits (`YYMMDD`).
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidMrzInput` if a field is malformed.
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_auth::AuthError;
    /// #
    /// # fn main() -> Result<(), AuthError> {
    /// use mrtd_auth::MrzKey;
    /// let mrz_key = MrzKey::new("L898902C3", "740812", "120415")?;
    /// assert_eq!(mrz_key.seed()?, String::from("L898902C3674081221204159"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(doc_no: &str, birthdate: &str, expirydate: &str) -> Result<Self, AuthError> {
        if doc_no.is_empty()
            || doc_no.len() > 22
            || doc_no
                .chars()
                .any(|c| !"0123456789<ABCDEFGHIJKLMNOPQRSTUVWXYZ".contains(c))
        {
            error!("Document number must be 1 to 22 MRZ characters, received {doc_no}");
            return Err(AuthError::InvalidMrzInput(
                "Document number",
                doc_no.to_owned(),
            ));
        }
        if birthdate.len() != 6 || birthdate.chars().any(|c| !c.is_ascii_digit()) {
            error!("Birth date must be exactly 6 digits, received {birthdate}");
            return Err(AuthError::InvalidMrzInput(
                "Birth date",
                birthdate.to_owned(),
            ));
        }
        if expirydate.len() != 6 || expirydate.chars().any(|c| !c.is_ascii_digit()) {
            error!("Expiry date must be exactly 6 digits, received {expirydate}");
            return Err(AuthError::InvalidMrzInput(
                "Expiry date",
                expirydate.to_owned(),
            ));
        }

        Ok(Self {
            doc_no: doc_no.to_owned(),
            birthdate: birthdate.to_owned(),
            expirydate: expirydate.to_owned(),
        })
    }

    /// Returns the key seed string `doc_no ‖ cd ‖ birthdate ‖ cd ‖ expirydate ‖ cd`
    /// with the document number padded to nine characters with `<`.
    ///
    /// This is the "MRZ information" input of ICAO Doc 9303-11 Section 4.3.2
    /// (BAC) and Section 9.7.3 (PACE with the MRZ password).
    ///
    /// # Errors
    ///
    /// * `AuthError` if a check digit can not be computed.
    pub fn seed(&self) -> Result<String, AuthError> {
        Ok(format!(
            "{:<<9}{}{}{}{}{}",
            self.doc_no,
            calculate_check_digit(&self.doc_no)?,
            self.birthdate,
            calculate_check_digit(&self.birthdate)?,
            self.expirydate,
            calculate_check_digit(&self.expirydate)?
        ))
    }
}

/// Calculates the check digit for the given data using a specific algorithm.
/// Calculation is explained at ICAO Doc 9303-3 Section 4.9:
/// <https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf>
///
/// # Errors
///
/// * `AuthError` if an invalid character is given.
fn calculate_check_digit(data: &str) -> Result<char, AuthError> {
    #[rustfmt::skip]
    let values: BTreeMap<char, u32> = [
        ('0', 0), ('1', 1), ('2', 2), ('3', 3), ('4', 4), ('5', 5), ('6', 6), ('7', 7),
        ('8', 8), ('9', 9), ('<', 0), ('A', 10), ('B', 11), ('C', 12), ('D', 13), ('E', 14),
        ('F', 15), ('G', 16), ('H', 17), ('I', 18), ('J', 19), ('K', 20), ('L', 21), ('M', 22),
        ('N', 23), ('O', 24), ('P', 25), ('Q', 26), ('R', 27), ('S', 28), ('T', 29), ('U', 30),
        ('V', 31), ('W', 32), ('X', 33), ('Y', 34), ('Z', 35),
    ]
    .iter()
    .copied()
    .collect();

    let weights = [7, 3, 1];
    let mut total = 0;

    for (counter, value) in data.chars().enumerate() {
        if let Some(weighted_value) = values.get(&value).copied() {
            total += weights[counter % 3] * weighted_value;
        } else {
            error!("Can not calculate check digit for invalid character: `{value}`");
            return Err(AuthError::ParseMrzCharError(value));
        }
    }

    let check_digit =
        char::from_digit(total % 10, 10).expect("usize % 10 can not be greater than 10");
    Ok(check_digit)
}
