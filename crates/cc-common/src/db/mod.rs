pub mod charts;
pub mod documents;
pub mod migrations;
pub mod pool;
pub mod queue;

pub use charts::{
    create_queued, delete_chart, get_chart, get_chart_by_session, mark_processing, record_error,
    reset_for_retry, save_user_modifications, store_results, submit_final_codes,
    update_review_status, ChartStorageError,
};
pub use documents::{
    create as create_document, list_by_chart, update_ocr_result, update_summary,
    DocumentStorageError,
};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool_from_url, create_pool_from_url_checked, DbPoolError, PgPool};
pub use queue::{
    claim_next, cleanup, complete, enqueue, fail, get_job, get_job_status, get_stats,
    jobs_by_chart, notify_chart, notify_status, release_stuck, retry, QueueStorageError,
};
