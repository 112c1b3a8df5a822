use async_trait::async_trait;
use busline_core::lock::{SeatClaim, SeatLock};
use busline_core::repository::SeatLockStore;
use busline_core::{CoreError, CoreResult};
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use tracing::{debug, info};
use uuid::Uuid;

const EXPIRY_INDEX: &str = "seat-locks:expiry";
const CLEAN_BATCH: usize = 1000;

// Seat values are `H|<booking>|<acquired_ms>|<expires_ms>` or `B|<booking>|<booked_ms>|0`.
// KEYS[1] is the trip's seat set, KEYS[2] the expiry index, KEYS[3..] the seat keys.

const ACQUIRE_SCRIPT: &str = r#"
local booking, now, expires, trip = ARGV[1], ARGV[2], ARGV[3], ARGV[4]
local conflicts = {}
for i = 3, #KEYS do
    local value = redis.call("GET", KEYS[i])
    if value then
        local state, owner, _, exp = string.match(value, "^(%u)|([^|]+)|(%d+)|(%d+)$")
        if not state or state == "B" or (owner ~= booking and tonumber(exp) >= tonumber(now)) then
            table.insert(conflicts, ARGV[i + 2])
        end
    end
end
if #conflicts > 0 then
    return {"0", unpack(conflicts)}
end
for i = 3, #KEYS do
    local seat = ARGV[i + 2]
    redis.call("SET", KEYS[i], "H|" .. booking .. "|" .. now .. "|" .. expires)
    redis.call("ZADD", KEYS[2], expires, trip .. ":" .. seat)
    redis.call("SADD", KEYS[1], seat)
end
return {"1"}
"#;

const RELEASE_SCRIPT: &str = r#"
local booking, trip = ARGV[1], ARGV[2]
local removed = 0
for i = 3, #KEYS do
    local value = redis.call("GET", KEYS[i])
    if value then
        local _, owner = string.match(value, "^(%u)|([^|]+)|")
        if owner == booking then
            local seat = ARGV[i]
            redis.call("DEL", KEYS[i])
            redis.call("ZREM", KEYS[2], trip .. ":" .. seat)
            redis.call("SREM", KEYS[1], seat)
            removed = removed + 1
        end
    end
end
return removed
"#;

const CONVERT_SCRIPT: &str = r#"
local booking, now, trip = ARGV[1], ARGV[2], ARGV[3]
local conflicts = {}
local owned = {}
for i = 3, #KEYS do
    local value = redis.call("GET", KEYS[i])
    if value then
        local state, owner, _, exp = string.match(value, "^(%u)|([^|]+)|(%d+)|(%d+)$")
        if not state then
            table.insert(conflicts, ARGV[i + 1])
        elseif owner == booking then
            owned[i] = state
        elseif state == "B" or tonumber(exp) >= tonumber(now) then
            table.insert(conflicts, ARGV[i + 1])
        end
    end
end
if #conflicts > 0 then
    return {"0", unpack(conflicts)}
end
for i = 3, #KEYS do
    if owned[i] ~= "B" then
        local seat = ARGV[i + 1]
        redis.call("SET", KEYS[i], "B|" .. booking .. "|" .. now .. "|0")
        redis.call("ZREM", KEYS[2], trip .. ":" .. seat)
        redis.call("SADD", KEYS[1], seat)
    end
end
return {"1"}
"#;

const RESTORE_SCRIPT: &str = r#"
local booking, now, expires, trip = ARGV[1], ARGV[2], ARGV[3], ARGV[4]
local restored = 0
for i = 3, #KEYS do
    local value = redis.call("GET", KEYS[i])
    if value then
        local state, owner = string.match(value, "^(%u)|([^|]+)|")
        if state == "B" and owner == booking then
            local seat = ARGV[i + 2]
            redis.call("SET", KEYS[i], "H|" .. booking .. "|" .. now .. "|" .. expires)
            redis.call("ZADD", KEYS[2], expires, trip .. ":" .. seat)
            restored = restored + 1
        end
    end
end
return restored
"#;

// KEYS[1] is the expiry index. Members are `<trip>:<seat>`.
const CLEAN_SCRIPT: &str = r#"
local cutoff = tonumber(ARGV[1])
local members = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
local removed = 0
for _, member in ipairs(members) do
    local trip, seat = string.match(member, "^([^:]+):(.+)$")
    if trip then
        local key = "seat:" .. trip .. ":" .. seat
        local value = redis.call("GET", key)
        if value then
            local state, _, _, exp = string.match(value, "^(%u)|([^|]+)|(%d+)|(%d+)$")
            if state == "H" and tonumber(exp) < cutoff then
                redis.call("DEL", key)
                redis.call("SREM", "trip:" .. trip .. ":seats", seat)
                removed = removed + 1
            end
        end
    end
    redis.call("ZREM", KEYS[1], member)
end
return removed
"#;

/// Seat locks in Redis. Every multi-seat operation is one Lua script, so it
/// is atomic with respect to every other client.
#[derive(Clone)]
pub struct RedisSeatLockStore {
    client: redis::Client,
    acquire: redis::Script,
    release: redis::Script,
    convert: redis::Script,
    restore: redis::Script,
    clean: redis::Script,
}

impl RedisSeatLockStore {
    pub fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self {
            client,
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
            convert: redis::Script::new(CONVERT_SCRIPT),
            restore: redis::Script::new(RESTORE_SCRIPT),
            clean: redis::Script::new(CLEAN_SCRIPT),
        })
    }

    async fn connection(&self) -> CoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(storage_error)
    }

    pub async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

fn seat_key(trip_id: Uuid, seat_id: &str) -> String {
    format!("seat:{}:{}", trip_id, seat_id)
}

fn trip_key(trip_id: Uuid) -> String {
    format!("trip:{}:seats", trip_id)
}

fn storage_error(err: redis::RedisError) -> CoreError {
    CoreError::Storage(format!("redis: {}", err))
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Decode a stored seat value. Unparseable values yield `None`.
fn parse_claim(trip_id: Uuid, seat_id: &str, raw: &str) -> Option<SeatClaim> {
    let mut parts = raw.split('|');
    let state = parts.next()?;
    let booking_id = Uuid::parse_str(parts.next()?).ok()?;
    let first = from_millis(parts.next()?.parse().ok()?)?;
    let second: i64 = parts.next()?.parse().ok()?;

    match state {
        "H" => Some(SeatClaim::Held(SeatLock {
            trip_id,
            seat_id: seat_id.to_string(),
            holder_booking_id: booking_id,
            acquired_at: first,
            expires_at: from_millis(second)?,
        })),
        "B" => Some(SeatClaim::Booked {
            trip_id,
            seat_id: seat_id.to_string(),
            booking_id,
            booked_at: first,
        }),
        _ => None,
    }
}

/// Script replies are `["1"]` on success or `["0", conflicting seats...]`.
fn into_outcome(trip_id: Uuid, reply: Vec<String>) -> CoreResult<()> {
    match reply.split_first() {
        Some((flag, _)) if flag == "1" => Ok(()),
        Some((flag, seats)) if flag == "0" => Err(CoreError::SeatConflict {
            trip_id,
            seat_ids: seats.to_vec(),
        }),
        _ => Err(CoreError::Storage(format!("unexpected seat script reply {:?}", reply))),
    }
}

#[async_trait]
impl SeatLockStore for RedisSeatLockStore {
    async fn acquire(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatLock>> {
        let mut conn = self.connection().await?;
        let mut invocation = self.acquire.prepare_invoke();
        invocation.key(trip_key(trip_id)).key(EXPIRY_INDEX);
        for seat_id in seat_ids {
            invocation.key(seat_key(trip_id, seat_id));
        }
        invocation
            .arg(booking_id.to_string())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(trip_id.to_string());
        for seat_id in seat_ids {
            invocation.arg(seat_id);
        }

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(storage_error)?;
        into_outcome(trip_id, reply)?;

        Ok(seat_ids
            .iter()
            .map(|seat_id| SeatLock {
                trip_id,
                seat_id: seat_id.clone(),
                holder_booking_id: booking_id,
                acquired_at: now,
                expires_at,
            })
            .collect())
    }

    async fn release(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<usize> {
        let mut conn = self.connection().await?;
        let mut invocation = self.release.prepare_invoke();
        invocation.key(trip_key(trip_id)).key(EXPIRY_INDEX);
        for seat_id in seat_ids {
            invocation.key(seat_key(trip_id, seat_id));
        }
        invocation.arg(booking_id.to_string()).arg(trip_id.to_string());
        for seat_id in seat_ids {
            invocation.arg(seat_id);
        }

        let removed: usize = invocation.invoke_async(&mut conn).await.map_err(storage_error)?;
        Ok(removed)
    }

    async fn convert(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        let mut invocation = self.convert.prepare_invoke();
        invocation.key(trip_key(trip_id)).key(EXPIRY_INDEX);
        for seat_id in seat_ids {
            invocation.key(seat_key(trip_id, seat_id));
        }
        invocation
            .arg(booking_id.to_string())
            .arg(now.timestamp_millis())
            .arg(trip_id.to_string());
        for seat_id in seat_ids {
            invocation.arg(seat_id);
        }

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(storage_error)?;
        into_outcome(trip_id, reply)
    }

    async fn restore(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let mut conn = self.connection().await?;
        let mut invocation = self.restore.prepare_invoke();
        invocation.key(trip_key(trip_id)).key(EXPIRY_INDEX);
        for seat_id in seat_ids {
            invocation.key(seat_key(trip_id, seat_id));
        }
        invocation
            .arg(booking_id.to_string())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(trip_id.to_string());
        for seat_id in seat_ids {
            invocation.arg(seat_id);
        }

        let restored: usize = invocation.invoke_async(&mut conn).await.map_err(storage_error)?;
        Ok(restored)
    }

    async fn clean_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let mut conn = self.connection().await?;
        let mut total = 0;
        loop {
            let removed: usize = self
                .clean
                .key(EXPIRY_INDEX)
                .arg(cutoff.timestamp_millis())
                .arg(CLEAN_BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(storage_error)?;
            total += removed;

            let remaining: usize = conn
                .zcount(EXPIRY_INDEX, "-inf", format!("({}", cutoff.timestamp_millis()))
                .await
                .map_err(storage_error)?;
            if remaining == 0 {
                break;
            }
            debug!(remaining, "More lapsed seat locks to clean");
        }
        if total > 0 {
            info!(removed = total, "Lapsed seat locks removed from redis");
        }
        Ok(total)
    }

    async fn claims(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatClaim>> {
        let mut conn = self.connection().await?;
        let seat_ids: Vec<String> = conn.smembers(trip_key(trip_id)).await.map_err(storage_error)?;
        if seat_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = seat_ids.iter().map(|seat_id| seat_key(trip_id, seat_id)).collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await.map_err(storage_error)?;

        let mut claims: Vec<SeatClaim> = seat_ids
            .iter()
            .zip(values)
            .filter_map(|(seat_id, raw)| parse_claim(trip_id, seat_id, raw.as_deref()?))
            .filter(|claim| claim.blocks(now))
            .collect();
        claims.sort_by(|a, b| a.seat_id().cmp(b.seat_id()));
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_held_and_booked_values() {
        let trip = Uuid::new_v4();
        let booking = Uuid::new_v4();

        let held = parse_claim(trip, "S1", &format!("H|{}|1704103200000|1704103500000", booking)).unwrap();
        match held {
            SeatClaim::Held(lock) => {
                assert_eq!(lock.holder_booking_id, booking);
                assert_eq!(lock.expires_at - lock.acquired_at, chrono::Duration::minutes(5));
            }
            other => panic!("unexpected claim {:?}", other),
        }

        let booked = parse_claim(trip, "S1", &format!("B|{}|1704103200000|0", booking)).unwrap();
        assert!(matches!(booked, SeatClaim::Booked { .. }));

        assert!(parse_claim(trip, "S1", "garbage").is_none());
    }

    #[test]
    fn test_script_reply_mapping() {
        let trip = Uuid::new_v4();
        assert!(into_outcome(trip, vec!["1".into()]).is_ok());

        match into_outcome(trip, vec!["0".into(), "S2".into()]) {
            Err(CoreError::SeatConflict { seat_ids, .. }) => assert_eq!(seat_ids, vec!["S2".to_string()]),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(into_outcome(trip, vec![]), Err(CoreError::Storage(_))));
    }
}
