/*
    Tests for the transaction log

    - Local appends and ownership checks
    - Remote chunk verification, dedupe and out of order handling
    - Chunked sync content for large sessions
*/

mod core_tests;
mod chunking_tests;
