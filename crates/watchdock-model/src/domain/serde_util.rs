use serde::{Deserialize, Deserializer};

/// Accept `null` wherever a default value is acceptable.
///
/// Engine snapshots routinely carry `"Cmd": null` or `"Env": null`.
pub(crate) fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}
