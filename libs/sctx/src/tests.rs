#[cfg(test)]
mod context_tests {
    use crate::{ServiceContext, ServiceContextBuilder};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn service_context_is_shareable() {
        assert_send_sync::<ServiceContext>();
        assert_send_sync::<ServiceContextBuilder>();
    }

    #[test]
    fn empty_context_builds() {
        let ctx = ServiceContext::builder().with_name("empty").build();
        assert!(ctx.is_ok(), "Empty context should build successfully");
    }

    // Note: ordering, rollback and outenv properties are covered by the
    // integration tests under `tests/`.
}
