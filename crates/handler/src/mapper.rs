//! Maps parsed bulletin tables onto item streams and builds the refresh
//! messages.
//!
//! One refresh per row whose key is in the resource's item map. Numeric
//! cells are quantized to a signed-64 mantissa at exponent −6 with
//! round-half-up; NaN binds a blank field. Rows publish in payload order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use psych_metadata::{Config, Resource};

use crate::bulletin::Bulletin;
use crate::provider::{ItemStream, Provider};
use crate::wire::{
    FieldEntry, FieldValue, RefreshMsg, RespStatus, WireMsg, MODEL_MARKET_PRICE,
};

/// RDM field identifiers.
pub const FID_STOCK_RIC: i32 = 1026;
pub const FID_SF_NAME: i32 = 1686;
pub const FID_TIMESTAMP: i32 = 6378;
pub const FID_ENGINE_VERSION: i32 = 8569;

/// Published values carry six decimal places.
const SCALE: f64 = 1_000_000.0;
pub const EXPONENT: i8 = -6;

pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Quantized mantissa for the wire's Real64 at exponent −6.
pub fn mantissa(x: f64) -> i64 {
    round_half_up(x * SCALE) as i64
}

/// The value a consumer decodes back from [`mantissa`].
pub fn quantize(x: f64) -> f64 {
    mantissa(x) as f64 / SCALE
}

/// One resolved item: where a row key publishes to.
pub struct MappedItem {
    pub ric: String,
    pub topic: String,
    pub stream: Arc<ItemStream>,
}

/// Resource name → row key → resolved item. Holds the strong stream
/// references for the life of the process; built once at init.
pub struct QueryVector {
    by_resource: HashMap<String, HashMap<String, MappedItem>>,
}

impl QueryVector {
    /// Resolve every configured item, creating one stream per distinct
    /// ric process-wide; the same downstream item backing several
    /// sectors (or several resources) shares its stream.
    pub fn build(provider: &Provider, resources: &[Resource]) -> Self {
        let mut streams: HashMap<String, Arc<ItemStream>> = HashMap::new();
        let mut by_resource = HashMap::new();
        for resource in resources {
            let mut name_map = HashMap::new();
            for (key, item) in &resource.items {
                let stream = match streams.get(&item.ric) {
                    Some(stream) => {
                        debug!(ric = %item.ric, "re-use stream");
                        Arc::clone(stream)
                    }
                    None => {
                        let stream = provider.create_item_stream(&item.ric);
                        streams.insert(item.ric.clone(), Arc::clone(&stream));
                        stream
                    }
                };
                name_map.insert(
                    key.clone(),
                    MappedItem {
                        ric: item.ric.clone(),
                        topic: item.topic.clone(),
                        stream,
                    },
                );
            }
            by_resource.insert(resource.name.clone(), name_map);
        }
        Self { by_resource }
    }

    pub fn lookup(&self, resource: &str, key: &str) -> Option<&MappedItem> {
        self.by_resource.get(resource)?.get(key)
    }

    /// Distinct streams held across all resources.
    pub fn stream_count(&self) -> usize {
        let mut rics: Vec<&str> = self
            .by_resource
            .values()
            .flat_map(|m| m.values().map(|item| item.ric.as_str()))
            .collect();
        rics.sort_unstable();
        rics.dedup();
        rics.len()
    }
}

/// Publish one refresh per mapped row of a parsed bulletin. Returns how
/// many refreshes were dispatched.
pub fn send_refresh(
    provider: &Provider,
    config: &Config,
    resource: &Resource,
    bulletin: &Bulletin,
    query_vector: &QueryVector,
) -> usize {
    let rwf = provider.rwf_version();
    let permission_data = provider.encode_lock(&[resource.entitlement_code]);
    let timestamp = bulletin.close_time.format("%Y-%m-%d %H:%M:%S.000").to_string();

    let mut sent = 0;
    for row in &bulletin.rows {
        let Some(item) = query_vector.lookup(&resource.name, &row.key) else {
            debug!(resource = %resource.name, key = %row.key, "unmapped row");
            continue;
        };

        let mut fields = vec![
            FieldEntry { fid: FID_STOCK_RIC, value: FieldValue::Ascii(item.ric.clone()) },
            FieldEntry { fid: FID_SF_NAME, value: FieldValue::Rmtes(resource.source.clone()) },
            FieldEntry {
                fid: FID_ENGINE_VERSION,
                value: FieldValue::Rmtes(bulletin.engine_version.clone()),
            },
            FieldEntry { fid: FID_TIMESTAMP, value: FieldValue::Rmtes(timestamp.clone()) },
        ];

        // Column 0 is the row key label and carries no data; values are
        // offset by one from the column list.
        for (index, column) in bulletin.columns.iter().enumerate().skip(1) {
            let Some(&fid) = resource.fields.get(column) else {
                debug!(column = %column, "unmapped column");
                continue;
            };
            let value = row.values[index - 1];
            let value = if value.is_nan() {
                FieldValue::Blank
            } else {
                FieldValue::Real64 { mantissa: mantissa(value), exponent: EXPONENT }
            };
            fields.push(FieldEntry { fid, value });
        }

        let msg = RefreshMsg {
            model_type: MODEL_MARKET_PRICE,
            unsolicited: true,
            complete: true,
            rwf,
            service_name: config.service_name.clone(),
            item_name: item.ric.clone(),
            status: RespStatus::open_ok(),
            fields,
            permission_data: permission_data.clone(),
        };
        provider.send(&item.stream, &WireMsg::Refresh(msg));
        sent += 1;
    }
    sent
}
