use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_catalog_tables::Migration),
            Box::new(m20240101_000002_create_shipping_tables::Migration),
            Box::new(m20240101_000003_create_coupons_table::Migration),
            Box::new(m20240101_000004_create_cart_tables::Migration),
            Box::new(m20240101_000005_create_order_tables::Migration),
            Box::new(m20240101_000006_create_checkout_sessions_table::Migration),
        ]
    }
}

fn money(col: impl IntoIden + 'static) -> ColumnDef {
    ColumnDef::new(col)
        .decimal_len(16, 4)
        .not_null()
        .default(0)
        .to_owned()
}

mod m20240101_000001_create_catalog_tables {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(&mut money(Products::Price))
                        .col(
                            ColumnDef::new(Products::Stock)
                                .integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(Products::Stock).gte(0)),
                        )
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(Products::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Products::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Products {
        Table,
        Id,
        Name,
        Price,
        Stock,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_shipping_tables {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_shipping_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Cities::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Cities::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Cities::Name).string().not_null())
                        .col(ColumnDef::new(Cities::Country).string().not_null())
                        .col(&mut money(Cities::ShippingPrice))
                        .col(ColumnDef::new(Cities::CreatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShippingAddresses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingAddresses::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(ShippingAddresses::OwnerId).uuid().not_null())
                        .col(ColumnDef::new(ShippingAddresses::Address).string().not_null())
                        .col(ColumnDef::new(ShippingAddresses::Phone).string().not_null())
                        .col(ColumnDef::new(ShippingAddresses::CityId).uuid().not_null())
                        .col(
                            ColumnDef::new(ShippingAddresses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_addresses_city")
                                .from(ShippingAddresses::Table, ShippingAddresses::CityId)
                                .to(Cities::Table, Cities::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_shipping_addresses_owner_id")
                        .table(ShippingAddresses::Table)
                        .col(ShippingAddresses::OwnerId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ShippingAddresses::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Cities::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Cities {
        Table,
        Id,
        Name,
        Country,
        ShippingPrice,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub enum ShippingAddresses {
        Table,
        Id,
        OwnerId,
        Address,
        Phone,
        CityId,
        CreatedAt,
    }
}

mod m20240101_000003_create_coupons_table {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_coupons_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Coupons::Code).string_len(64).not_null())
                        .col(ColumnDef::new(Coupons::DiscountType).string_len(20).not_null())
                        .col(&mut money(Coupons::DiscountValue))
                        .col(ColumnDef::new(Coupons::MaxUsage).integer().not_null())
                        .col(
                            ColumnDef::new(Coupons::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(&mut money(Coupons::MinOrderValue))
                        .col(ColumnDef::new(Coupons::ExpiredAt).timestamp_with_time_zone().not_null())
                        .col(
                            ColumnDef::new(Coupons::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(Coupons::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Coupons::UpdatedAt).timestamp_with_time_zone().not_null())
                        .check(Expr::col(Coupons::UsedCount).lte(Expr::col(Coupons::MaxUsage)))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Coupons {
        Table,
        Id,
        Code,
        DiscountType,
        DiscountValue,
        MaxUsage,
        UsedCount,
        MinOrderValue,
        ExpiredAt,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000004_create_cart_tables {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Carts::OwnerId).uuid().not_null())
                        .col(ColumnDef::new(Carts::CouponId).uuid().null())
                        .col(ColumnDef::new(Carts::CouponCode).string_len(64).null())
                        .col(&mut money(Carts::Subtotal))
                        .col(&mut money(Carts::Discount))
                        .col(&mut money(Carts::Total))
                        .col(
                            ColumnDef::new(Carts::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(ColumnDef::new(Carts::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Carts::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            // One live cart per user; get-or-create relies on this.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_owner_id")
                        .table(Carts::Table)
                        .col(Carts::OwnerId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::ProductId).uuid().not_null())
                        .col(&mut money(CartItems::UnitPrice))
                        .col(
                            ColumnDef::new(CartItems::Quantity)
                                .integer()
                                .not_null()
                                .check(Expr::col(CartItems::Quantity).gte(1)),
                        )
                        .col(ColumnDef::new(CartItems::Color).string().null())
                        .col(ColumnDef::new(CartItems::Size).string().null())
                        .col(&mut money(CartItems::LineTotal))
                        .col(ColumnDef::new(CartItems::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(CartItems::UpdatedAt).timestamp_with_time_zone().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_id")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Carts {
        Table,
        Id,
        OwnerId,
        CouponId,
        CouponCode,
        Subtotal,
        Discount,
        Total,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum CartItems {
        Table,
        Id,
        CartId,
        ProductId,
        UnitPrice,
        Quantity,
        Color,
        Size,
        LineTotal,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000005_create_order_tables {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Orders::OrderNumber).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::OwnerId).uuid().not_null())
                        .col(ColumnDef::new(Orders::CartId).uuid().not_null())
                        .col(ColumnDef::new(Orders::IdempotencyKey).string_len(255).null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::PaymentStatus).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(&mut money(Orders::Subtotal))
                        .col(&mut money(Orders::Discount))
                        .col(&mut money(Orders::ShippingCost))
                        .col(&mut money(Orders::Total))
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::CouponId).uuid().null())
                        .col(ColumnDef::new(Orders::CouponCode).string_len(64).null())
                        .col(ColumnDef::new(Orders::ShippingAddressId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ShippingAddress).string().not_null())
                        .col(ColumnDef::new(Orders::ShippingPhone).string().not_null())
                        .col(ColumnDef::new(Orders::ShippingCity).string().not_null())
                        .col(
                            ColumnDef::new(Orders::IsPaid)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Orders::PaidAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Orders::IsDelivered)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Orders::DeliveredAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Orders::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone().not_null())
                        .col(
                            ColumnDef::new(Orders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // A replayed checkout with the same key must land on the same order.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_owner_idempotency_key")
                        .table(Orders::Table)
                        .col(Orders::OwnerId)
                        .col(Orders::IdempotencyKey)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_owner_created_at")
                        .table(Orders::Table)
                        .col(Orders::OwnerId)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string().not_null())
                        .col(&mut money(OrderItems::UnitPrice))
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(OrderItems::Color).string().null())
                        .col(ColumnDef::new(OrderItems::Size).string().null())
                        .col(&mut money(OrderItems::LineTotal))
                        .col(ColumnDef::new(OrderItems::CreatedAt).timestamp_with_time_zone().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Orders {
        Table,
        Id,
        OrderNumber,
        OwnerId,
        CartId,
        IdempotencyKey,
        PaymentMethod,
        PaymentStatus,
        Status,
        Subtotal,
        Discount,
        ShippingCost,
        Total,
        Currency,
        CouponId,
        CouponCode,
        ShippingAddressId,
        ShippingAddress,
        ShippingPhone,
        ShippingCity,
        IsPaid,
        PaidAt,
        IsDelivered,
        DeliveredAt,
        CreatedAt,
        UpdatedAt,
        Version,
    }

    #[derive(DeriveIden)]
    pub enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        ProductName,
        UnitPrice,
        Quantity,
        Color,
        Size,
        LineTotal,
        CreatedAt,
    }
}

mod m20240101_000006_create_checkout_sessions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_checkout_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::OrderId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutSessions::Provider).string_len(32).not_null())
                        .col(
                            ColumnDef::new(CheckoutSessions::ProviderReference)
                                .string_len(255)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::CheckoutUrl).text().not_null())
                        .col(ColumnDef::new(CheckoutSessions::SuccessUrl).text().null())
                        .col(ColumnDef::new(CheckoutSessions::CancelUrl).text().null())
                        .col(ColumnDef::new(CheckoutSessions::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(CheckoutSessions::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_provider_reference")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::ProviderReference)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_status_expires_at")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::Status)
                        .col(CheckoutSessions::ExpiresAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum CheckoutSessions {
        Table,
        Id,
        OrderId,
        Provider,
        ProviderReference,
        CheckoutUrl,
        SuccessUrl,
        CancelUrl,
        Status,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }
}
