use sqlx::PgPool;

pub async fn count_table_rows(pool: &PgPool, table: &str) -> i64 {
    let query = format!("SELECT COUNT(*) as count FROM {}", table);
    sqlx::query_scalar::<_, i64>(&query)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}
