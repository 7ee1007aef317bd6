use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::models::{AttendanceEvent, CalendarDay, CapacityRule, ForecastRow, MemberHold, RiskFlag};
use crate::pipeline::PipelineInputs;
use crate::traits::ForecastStore;

/// Rows per INSERT statement; keeps bind parameters well under the protocol limit.
const UPSERT_CHUNK_SIZE: usize = 1000;

const ATTENDANCE_QUERY: &str = r#"
    SELECT
        session_date::date AS session_date,
        session_start::time AS session_start,
        session_end::time AS session_end,
        session_name::text AS session_name,
        member_id::text AS member_id,
        coach_name::text AS coach_name
    FROM member_daily_sessions_attended
    WHERE session_date IS NOT NULL
      AND session_start IS NOT NULL
      AND session_name IS NOT NULL
      AND member_id IS NOT NULL
    ORDER BY session_date, session_name, session_start
"#;

const CALENDAR_QUERY: &str = r#"
    SELECT
        the_date::date AS the_date,
        COALESCE(is_business_day, true) AS is_business_day,
        holiday_name::text AS holiday_name
    FROM work_calendar
    WHERE the_date IS NOT NULL
    ORDER BY the_date
"#;

const HOLDS_QUERY: &str = r#"
    SELECT
        member_id::text AS member_id,
        hold_start::date AS hold_start,
        hold_end::date AS hold_end
    FROM member_holds
    WHERE member_id IS NOT NULL AND hold_start IS NOT NULL
"#;

const CAPACITY_QUERY: &str = r#"
    SELECT
        config_key::text AS config_key,
        match_pattern::text AS match_pattern,
        capacity::float8 AS capacity
    FROM system_config
"#;

/// Table names are interpolated into SQL, so only plain identifiers
/// (optionally schema-qualified) are accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        anyhow::bail!("Invalid forecast table name: {:?}", name);
    }
    Ok(())
}

fn upsert_prefix(table: &str) -> String {
    format!(
        "INSERT INTO {} (session_date, session_name, session_start, session_end, \
         predicted_attendance, predicted_utilisation, risk_flag) ",
        table
    )
}

const UPSERT_SUFFIX: &str = " ON CONFLICT (session_date, session_name, session_start) DO UPDATE SET \
     session_end = EXCLUDED.session_end, \
     predicted_attendance = EXCLUDED.predicted_attendance, \
     predicted_utilisation = EXCLUDED.predicted_utilisation, \
     risk_flag = EXCLUDED.risk_flag";

/// PostgreSQL-backed store reading the operational tables directly.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
    forecast_table: String,
}

impl PostgresStore {
    pub async fn new(database_url: &str, forecast_table: &str) -> Result<Self> {
        validate_table_name(forecast_table)?;

        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self {
            pool,
            forecast_table: forecast_table.to_string(),
        })
    }

    pub fn forecast_table(&self) -> &str {
        &self.forecast_table
    }

    pub async fn fetch_attendance(&self) -> Result<Vec<AttendanceEvent>> {
        let rows = sqlx::query_as::<_, AttendanceEvent>(ATTENDANCE_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch member_daily_sessions_attended")?;
        debug!("Retrieved {} rows from member_daily_sessions_attended", rows.len());
        Ok(rows)
    }

    pub async fn fetch_calendar(&self) -> Result<Vec<CalendarDay>> {
        let rows = sqlx::query_as::<_, CalendarDay>(CALENDAR_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch work_calendar")?;
        debug!("Retrieved {} rows from work_calendar", rows.len());
        Ok(rows)
    }

    pub async fn fetch_holds(&self) -> Result<Vec<MemberHold>> {
        let rows = sqlx::query_as::<_, MemberHold>(HOLDS_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch member_holds")?;
        debug!("Retrieved {} rows from member_holds", rows.len());
        Ok(rows)
    }

    pub async fn fetch_capacity_rules(&self) -> Result<Vec<CapacityRule>> {
        let rows = sqlx::query_as::<_, CapacityRule>(CAPACITY_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch system_config")?;
        debug!("Retrieved {} rows from system_config", rows.len());
        Ok(rows)
    }

    /// Read back every forecast row, ordered by key.
    pub async fn fetch_forecasts(&self) -> Result<Vec<ForecastRow>> {
        let sql = format!(
            "SELECT session_date, session_name, session_start, session_end, \
             predicted_attendance, predicted_utilisation, risk_flag \
             FROM {} ORDER BY session_date, session_name, session_start",
            self.forecast_table
        );
        let rows: Vec<StoredForecast> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch forecast rows")?;

        rows.into_iter().map(StoredForecast::into_row).collect()
    }
}

#[derive(sqlx::FromRow)]
struct StoredForecast {
    session_date: chrono::NaiveDate,
    session_name: String,
    session_start: chrono::NaiveTime,
    session_end: Option<chrono::NaiveTime>,
    predicted_attendance: f64,
    predicted_utilisation: Option<f64>,
    risk_flag: String,
}

impl StoredForecast {
    fn into_row(self) -> Result<ForecastRow> {
        let risk_flag = self
            .risk_flag
            .parse::<RiskFlag>()
            .map_err(anyhow::Error::msg)?;
        Ok(ForecastRow {
            session_date: self.session_date,
            session_name: self.session_name,
            session_start: self.session_start,
            session_end: self.session_end,
            predicted_attendance: self.predicted_attendance,
            predicted_utilisation: self.predicted_utilisation,
            risk_flag,
        })
    }
}

impl ForecastStore for PostgresStore {
    async fn load_inputs(&self) -> Result<PipelineInputs> {
        let (attendance, calendar, holds, capacity_rules) = tokio::try_join!(
            self.fetch_attendance(),
            self.fetch_calendar(),
            self.fetch_holds(),
            self.fetch_capacity_rules(),
        )?;

        Ok(PipelineInputs {
            attendance,
            calendar,
            holds,
            capacity_rules,
        })
    }

    async fn upsert_forecasts(&self, rows: &[ForecastRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin forecast upsert transaction")?;

        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(upsert_prefix(&self.forecast_table));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.session_date)
                    .push_bind(row.session_name.clone())
                    .push_bind(row.session_start)
                    .push_bind(row.session_end)
                    .push_bind(row.predicted_attendance)
                    .push_bind(row.predicted_utilisation)
                    .push_bind(row.risk_flag.as_str());
            });
            builder.push(UPSERT_SUFFIX);

            builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to upsert into {}", self.forecast_table))?;
        }

        tx.commit()
            .await
            .context("Failed to commit forecast upsert")?;

        info!("Upserted {} rows into {}", rows.len(), self.forecast_table);
        Ok(rows.len())
    }
}
