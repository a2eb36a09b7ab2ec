//! Package, shipment and timestamp records persisted by the store
use std::cmp::Ordering;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::utils::new_uuid_to_bech32;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl Copy for TimeStamp<Utc> {}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus(&self, span: Duration) -> Self {
        Self(self.0 + span)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl std::fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    #[n(0)]
    Received,
    #[n(1)]
    Processing,
    #[n(2)]
    Shipped,
    #[n(3)]
    InTransit,
    #[n(4)]
    Arrived,
    #[n(5)]
    Delivered,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Received,
    #[n(2)]
    Processing,
    #[n(3)]
    Shipped,
    #[n(4)]
    InTransit,
    #[n(5)]
    Arrived,
    #[n(6)]
    Delivered,
}

/// Code fields carried on every package row.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeState {
    #[n(0)]
    pub code_hash: Option<String>, // argon2id PHC string, never the plaintext
    #[n(1)]
    pub fingerprint: Option<String>, // keyed hmac, hex. only used by the uniqueness index
    #[n(2)]
    pub generated_at: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub used_at: Option<TimeStamp<Utc>>, // write-once
    #[n(5)]
    pub used_by: Option<String>,
    #[n(6)]
    pub failed_attempts: u32,
    #[n(7)]
    pub locked_until: Option<TimeStamp<Utc>>,
}

impl CodeState {
    /// A code is active while it has a hash, is unused and has not expired.
    pub fn is_active(&self, now: &TimeStamp<Utc>) -> bool {
        self.code_hash.is_some()
            && self.used_at.is_none()
            && self.expires_at.as_ref().is_some_and(|exp| exp > now)
    }
}

/// A fresh code ready to be written onto a package row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    pub code_hash: String,
    pub fingerprint: String,
    pub generated_at: TimeStamp<Utc>,
    pub expires_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Package {
    #[n(0)]
    pub package_id: String, // bech32 encoded uuid7
    #[n(1)]
    pub tracking_number: String,
    #[n(2)]
    pub shipment_id: Option<String>, // empty until consolidated
    #[n(3)]
    pub recipient_id: String,
    #[n(4)]
    pub suite: String,
    #[n(5)]
    pub status: PackageStatus,
    #[n(6)]
    pub code: CodeState,
}

impl Package {
    pub fn new(tracking_number: &str, recipient_id: &str, suite: &str) -> anyhow::Result<Self> {
        Ok(Self {
            package_id: new_uuid_to_bech32("pkg_")?,
            tracking_number: tracking_number.to_string(),
            shipment_id: None,
            recipient_id: recipient_id.to_string(),
            suite: suite.to_string(),
            status: PackageStatus::Received,
            code: CodeState::default(),
        })
    }
    pub fn set_shipment(mut self, shipment_id: &str) -> Self {
        self.shipment_id = Some(shipment_id.to_string());
        self
    }
    pub fn set_status(mut self, status: PackageStatus) -> Self {
        self.status = status;
        self
    }
    pub fn is_delivered(&self) -> bool {
        self.status == PackageStatus::Delivered
    }
    pub fn has_active_code(&self, now: &TimeStamp<Utc>) -> bool {
        self.code.is_active(now)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    #[n(0)]
    pub shipment_id: String,
    #[n(1)]
    pub reference: String,
    #[n(2)]
    pub status: ShipmentStatus,
}

impl Shipment {
    pub fn new(reference: &str) -> anyhow::Result<Self> {
        Ok(Self {
            shipment_id: new_uuid_to_bech32("shp_")?,
            reference: reference.to_string(),
            status: ShipmentStatus::Pending,
        })
    }
    pub fn set_status(mut self, status: ShipmentStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let later = earlier.plus(Duration::seconds(1));
        let copy = earlier;

        assert!(earlier < later);
        assert!(later > copy);
        assert_eq!(earlier.max(later), later);
        assert_eq!(copy.cmp(&earlier), Ordering::Equal);
    }

    #[test]
    fn expired_and_used_codes_are_inactive() {
        let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let mut state = CodeState {
            code_hash: Some("phc".into()),
            expires_at: Some(now.plus(Duration::minutes(1))),
            ..CodeState::default()
        };
        assert!(state.is_active(&now));

        assert!(!state.is_active(&now.plus(Duration::minutes(1))));

        state.used_at = Some(now);
        assert!(!state.is_active(&now));
    }

    #[test]
    fn package_round_trips_through_cbor() {
        let pkg = Package::new("TRK-1", "user_1", "VC-010")
            .unwrap()
            .set_shipment("shp_x")
            .set_status(PackageStatus::Arrived);

        let bytes = minicbor::to_vec(&pkg).unwrap();
        let back: Package = minicbor::decode(&bytes).unwrap();

        assert_eq!(pkg, back);
        assert!(back.package_id.starts_with("pkg_1"));
    }
}
