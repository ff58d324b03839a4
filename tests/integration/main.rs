//! End-to-end tests driving the crawler against a mock GraphQL endpoint

mod crawl_tests;
