//! S3 staging for Redshift `COPY` loads.

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use outflow_types::error::{ConnectorError, Result};

use super::config::S3StagingConfig;
use crate::client::{LoadMode, StagingOptions};
use crate::ident;

/// Uploads and deletes staged CSV objects and renders the `COPY` statements.
pub struct S3Stager {
    client: S3Client,
    region: String,
    iam_role: String,
}

fn s3_error(action: &str, err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::transient_network("S3_ERROR", format!("S3 {action} failed: {err}"))
}

impl S3Stager {
    pub async fn new(config: &S3StagingConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key.expose_secret(),
                secret_key.expose_secret(),
                None,
                None,
                "outflow",
            );
            loader = loader.credentials_provider(creds);
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: S3Client::from_conf(builder.build()),
            region: config.region.clone(),
            iam_role: config.iam_role.clone(),
        }
    }

    pub(crate) async fn put(&self, csv: Bytes, opts: &StagingOptions) -> Result<()> {
        let size = csv.len();
        self.client
            .put_object()
            .bucket(&opts.bucket)
            .key(&opts.object_key)
            .body(ByteStream::from(csv))
            .content_type("text/csv")
            .send()
            .await
            .map_err(|e| s3_error("upload", e))?;
        tracing::debug!(bucket = %opts.bucket, key = %opts.object_key, bytes = size, "Staged CSV to S3");
        Ok(())
    }

    pub(crate) async fn delete(&self, opts: &StagingOptions) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&opts.bucket)
            .key(&opts.object_key)
            .send()
            .await
            .map_err(|e| s3_error("delete", e))?;
        Ok(())
    }

    pub(crate) fn load_statements(
        &self,
        namespace: &str,
        table: &str,
        opts: &StagingOptions,
    ) -> Result<Vec<String>> {
        copy_statements(namespace, table, opts, &self.iam_role, &self.region)
    }
}

fn sql_string(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// `[DELETE FROM t;] COPY t (cols) FROM 's3://…' …` for one staged file.
pub(crate) fn copy_statements(
    namespace: &str,
    table: &str,
    opts: &StagingOptions,
    iam_role: &str,
    region: &str,
) -> Result<Vec<String>> {
    let target = ident::qualified(namespace, table)?;
    let columns = opts
        .columns
        .iter()
        .map(|c| ident::validate(c))
        .collect::<Result<Vec<_>>>()?;

    let mut statements = Vec::with_capacity(2);
    if opts.load_mode == LoadMode::Truncate {
        statements.push(format!("DELETE FROM {target}"));
    }
    statements.push(format!(
        "COPY {target} ({}) FROM {} IAM_ROLE {} REGION {} FORMAT AS CSV IGNOREHEADER 1 EMPTYASNULL TIMEFORMAT 'auto'",
        columns.join(", "),
        sql_string(&format!("s3://{}/{}", opts.bucket, opts.object_key)),
        sql_string(iam_role),
        sql_string(region),
    ));
    Ok(statements)
}
