pub mod postgres;

pub use postgres::PostgresStatisticsSink;
