mod api_executions;
mod api_leads;
mod pg_store;
