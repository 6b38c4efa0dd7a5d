pub(crate) mod support;

mod property_tests;
